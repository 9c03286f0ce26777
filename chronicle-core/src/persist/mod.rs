//! 持久化协作方（persist）
//!
//! 运行时只依赖三个固定契约：
//! - `EventStore`：按流追加事件，基于期望序号做乐观并发控制；
//! - `EventLog`：按过滤条件订阅记录，先交付已持久化记录，再交付实时记录；
//! - `SnapshotStore`：按 (key, version) 读写快照。
//!
//! 具体后端（文件、文档数据库等）由上层实现并注入；`memory` 提供内存实现，
//! 用于测试、示例以及默认的元领域后端。
//!
mod event_log;
mod event_store;
mod memory;
mod snapshot_store;

pub use event_log::{EventLog, LogEntry, LogSubscription, RecordFilter, RecordStream};
pub use event_store::EventStore;
pub use memory::{InMemoryEventStore, InMemorySnapshotStore};
pub use snapshot_store::SnapshotStore;

use std::sync::Arc;

/// 一组协作方：事件存储 + 事件日志 + 快照存储
#[derive(Clone)]
pub struct Backend {
    pub event_store: Arc<dyn EventStore>,
    pub event_log: Arc<dyn EventLog>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
}

impl Backend {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        event_log: Arc<dyn EventLog>,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            event_store,
            event_log,
            snapshot_store,
        }
    }

    /// 完全基于内存的后端（事件存储同时充当事件日志）
    pub fn in_memory() -> Self {
        let store = InMemoryEventStore::new();
        Self::new(
            Arc::new(store.clone()),
            Arc::new(store),
            Arc::new(InMemorySnapshotStore::new()),
        )
    }
}
