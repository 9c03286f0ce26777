use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 领域事件：名称 + 载荷 + 发生时间
///
/// 时间缺省时由写入方（Aggregate）在持久化前以注入的时钟补齐；
/// 回放或迁移场景可通过 [`Event::at`] 显式指定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            time: None,
        }
    }

    /// 指定事件发生时间
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// 若尚未指定时间，则以给定时间补齐
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.time.get_or_insert(now);
        self
    }
}
