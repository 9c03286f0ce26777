use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 写意图：由恰好一个聚合定义处理
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub payload: Value,
    pub trace_id: String,
}

impl Command {
    /// 创建命令，并生成新的 trace id
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            trace_id: super::new_trace_id(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}
