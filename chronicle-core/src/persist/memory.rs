//! 内存版协作方
//!
//! - `InMemoryEventStore`：同时实现 `EventStore` 与 `EventLog`。追加在同一把锁内完成
//!   “校验流尾 → 分配序号 → 推送给订阅者”，订阅在同一把锁内完成“收集已持久化记录 →
//!   登记订阅者”，因此追平阶段与实时阶段之间不会丢失或重复记录；
//! - `InMemorySnapshotStore`：按 (key, version) 保存快照。
//!
//! 典型用途：测试环境、示例与本地开发。
use crate::clock::{Clock, SystemClock};
use crate::error::{UnitError, UnitResult as Result};
use crate::message::{Event, Record, Snapshot};
use crate::persist::{EventLog, EventStore, LogEntry, RecordFilter, RecordStream, SnapshotStore};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct LogInner {
    records: Vec<Record>,
    tails: HashMap<String, u64>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    filter: RecordFilter,
    tx: mpsc::UnboundedSender<LogEntry>,
}

/// 内存事件存储 + 事件日志
#[derive(Clone)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<LogInner>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    /// 使用注入的时钟为未带时间的事件补齐时间
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner::default())),
            clock,
        }
    }

    /// 按追加顺序返回全部记录
    pub async fn records(&self) -> Vec<Record> {
        self.inner.lock().await.records.clone()
    }

    /// 返回某条流的全部记录
    pub async fn stream(&self, stream_id: &str) -> Vec<Record> {
        self.inner
            .lock()
            .await
            .records
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .cloned()
            .collect()
    }

    /// 当前仍在接收实时记录的订阅者数量
    pub async fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|s| !s.tx.is_closed());
        inner.subscribers.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record(
        &self,
        events: Vec<Event>,
        stream_id: &str,
        on_sequence: u64,
        trace_id: &str,
    ) -> Result<Vec<Record>> {
        let mut inner = self.inner.lock().await;

        let tail = inner.tails.get(stream_id).copied().unwrap_or(0);
        if tail != on_sequence {
            return Err(UnitError::OutOfSequence {
                stream_id: stream_id.to_string(),
                expected: on_sequence,
                actual: tail,
            });
        }

        let now = self.clock.now();
        let records: Vec<Record> = events
            .into_iter()
            .zip(tail + 1..)
            .map(|(event, sequence)| {
                let event = event.stamped(now);
                let time = event.time.unwrap_or(now);
                Record::new(event, stream_id, sequence, trace_id, time)
            })
            .collect();

        if let Some(last) = records.last() {
            inner.tails.insert(stream_id.to_string(), last.sequence);
        }
        inner.records.extend(records.iter().cloned());

        // 推送给实时订阅者，顺带清理已关闭的订阅
        inner.subscribers.retain(|subscriber| {
            records
                .iter()
                .filter_map(|r| subscriber.filter.entry_for(r))
                .all(|entry| subscriber.tx.send(entry).is_ok())
        });

        Ok(records)
    }
}

#[async_trait]
impl EventLog for InMemoryEventStore {
    async fn subscribe(&self, filter: RecordFilter) -> Result<RecordStream> {
        let mut inner = self.inner.lock().await;

        let persisted: Vec<Result<LogEntry>> = inner
            .records
            .iter()
            .filter_map(|r| filter.entry_for(r))
            .map(Ok)
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.push(Subscriber { filter, tx });

        let live = UnboundedReceiverStream::new(rx).map(Ok);
        let stream = stream::iter(persisted)
            .chain(stream::once(async { Ok(LogEntry::CaughtUp) }))
            .chain(live);

        Ok(Box::pin(stream))
    }
}

/// 内存快照存储
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<(String, String), Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.lock().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn fetch(&self, key: &str, version: &str) -> Result<Snapshot> {
        self.snapshots
            .lock()
            .await
            .get(&(key.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| UnitError::SnapshotNotFound {
                key: key.to_string(),
                version: version.to_string(),
            })
    }

    async fn store(&self, key: &str, version: &str, snapshot: Snapshot) -> Result<()> {
        self.snapshots
            .lock()
            .await
            .insert((key.to_string(), version.to_string()), snapshot);
        Ok(())
    }
}
