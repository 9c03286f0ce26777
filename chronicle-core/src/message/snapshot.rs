use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Heads;

/// 实例状态在某一时刻的快照，以及恢复订阅所需的位点
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub heads: Heads,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_record_time: Option<DateTime<Utc>>,
    pub state: Value,
}

impl Snapshot {
    pub fn new(heads: Heads, state: Value) -> Self {
        Self {
            heads,
            last_record_time: None,
            state,
        }
    }

    pub fn with_last_record_time(mut self, time: Option<DateTime<Utc>>) -> Self {
        self.last_record_time = time;
        self
    }
}
