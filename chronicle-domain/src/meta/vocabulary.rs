//! 元领域的事件词汇（版本 1）
//!
//! 所有名称统一以 `reaction-` 为后缀或前缀，载荷字段使用 snake_case。
//!
use chrono::{DateTime, Utc};
use chronicle_core::message::Record;
use serde::{Deserialize, Serialize};

/// 元领域定义共用的快照版本
pub const VERSION: &str = "reaction-v1";

pub const LOCK_REACTION: &str = "lock-reaction";
pub const UNLOCK_REACTION: &str = "unlock-reaction";
pub const FAIL_REACTION: &str = "fail-reaction";
pub const REQUEST_REACTION_RETRY: &str = "request-reaction-retry";

pub const REACTION_LOCKED: &str = "reaction-locked";
pub const REACTION_UNLOCKED: &str = "reaction-unlocked";
pub const REACTION_FAILED: &str = "reaction-failed";
pub const REACTION_RETRY_REQUESTED: &str = "reaction-retry-requested";

pub const REACTION_HEADS: &str = "reaction-heads";
pub const LAST_CONSUMED_TIME: &str = "last-consumed-time";
pub const FAILED_REACTIONS: &str = "failed-reactions";

/// 加锁：`lock-reaction` 命令与 `reaction-locked` 事件共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionLock {
    pub saga_key: String,
    pub stream_id: String,
    pub sequence: u64,
    pub record_time: DateTime<Utc>,
}

impl ReactionLock {
    pub fn new(saga_key: &str, record: &Record) -> Self {
        Self {
            saga_key: saga_key.to_string(),
            stream_id: record.stream_id.clone(),
            sequence: record.sequence,
            record_time: record.time,
        }
    }
}

/// 解锁：`unlock-reaction` 命令与 `reaction-unlocked` 事件共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionUnlock {
    pub saga_key: String,
    pub stream_id: String,
    pub sequence: u64,
    /// 本次尝试是否成功
    pub completed: bool,
}

/// 重试请求：`request-reaction-retry` 命令与 `reaction-retry-requested` 事件共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRequest {
    pub saga: String,
    pub saga_id: String,
    pub saga_key: String,
    pub record: Record,
}
