use crate::error::UnitResult as Result;
use crate::message::{Event, Record};
use async_trait::async_trait;
use std::sync::Arc;

/// 事件存储：按流追加事件
#[async_trait]
pub trait EventStore: Send + Sync {
    /// 将事件追加到 `stream_id`。
    ///
    /// `on_sequence` 为写入方观察到的流尾序号；若与实际流尾不一致，
    /// 必须以 `UnitError::OutOfSequence` 失败且不写入任何事件。
    async fn record(
        &self,
        events: Vec<Event>,
        stream_id: &str,
        on_sequence: u64,
        trace_id: &str,
    ) -> Result<Vec<Record>>;
}

#[async_trait]
impl<T> EventStore for Arc<T>
where
    T: EventStore + ?Sized,
{
    async fn record(
        &self,
        events: Vec<Event>,
        stream_id: &str,
        on_sequence: u64,
        trace_id: &str,
    ) -> Result<Vec<Record>> {
        (**self)
            .record(events, stream_id, on_sequence, trace_id)
            .await
    }
}
