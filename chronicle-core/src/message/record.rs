use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Event;

/// 事件日志中的一条记录
///
/// `sequence` 由事件存储按流单调递增分配；对聚合而言 `stream_id` 即聚合 ID。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub event: Event,
    pub stream_id: String,
    pub sequence: u64,
    pub trace_id: String,
    pub time: DateTime<Utc>,
}

impl Record {
    pub fn new(
        event: Event,
        stream_id: impl Into<String>,
        sequence: u64,
        trace_id: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            stream_id: stream_id.into(),
            sequence,
            trace_id: trace_id.into(),
            time,
        }
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }
}
