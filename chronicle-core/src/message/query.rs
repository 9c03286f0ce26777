use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Heads;

/// 读意图：由恰好一个投影定义应答
///
/// `heads` 用于因果等待：投影在各流位点均不低于请求值之前不会应答。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    pub payload: Value,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heads: Option<Heads>,
}

impl Query {
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            trace_id: super::new_trace_id(),
            heads: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// 要求投影至少观察到给定位点后再应答（read-your-writes）
    pub fn with_heads(mut self, heads: impl Into<Heads>) -> Self {
        self.heads = Some(heads.into());
        self
    }
}
