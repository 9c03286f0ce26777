use crate::error::{UnitError, UnitResult as Result};
use crate::message::{Heads, Record};
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 订阅流中的一项：记录、被事件名过滤掉的位点，或“已追平持久化记录”的标记
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Record(Record),
    /// 只在 `RecordFilter::positions` 打开时交付
    Passed {
        stream_id: String,
        sequence: u64,
        time: DateTime<Utc>,
    },
    /// 之前的记录均为已持久化记录，之后的均为实时记录
    CaughtUp,
}

/// 'static 生命周期的订阅流，便于在 `tokio::spawn` 中消费
pub type RecordStream = BoxStream<'static, Result<LogEntry>>;

/// 订阅过滤条件
#[derive(Debug, Clone, Default, Builder)]
pub struct RecordFilter {
    /// 只交付这些事件名的记录
    #[builder(default, setters(name = event_name_set, vis = ""))]
    pub event_names: BTreeSet<String>,
    /// 限定在单条流上
    #[builder(into)]
    pub stream_id: Option<String>,
    /// 只交付序号大于对应流 head 的记录
    #[builder(default)]
    pub after: Heads,
    /// 只交付记录时间不早于该时间点的记录
    pub since: Option<DateTime<Utc>>,
    /// 事件名不匹配、其余条件满足的记录以 `LogEntry::Passed` 交付，
    /// 订阅方据此把各流 head 推进到它见过的流尾
    #[builder(default)]
    pub positions: bool,
}

// 导入由 bon::Builder 生成的 typestate 模块
use self::record_filter_builder::{IsUnset, SetEventNames, State as BuilderState};

impl<S: BuilderState> RecordFilterBuilder<S> {
    pub fn event_names(
        self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> RecordFilterBuilder<SetEventNames<S>>
    where
        <S as BuilderState>::EventNames: IsUnset,
    {
        self.event_name_set(names.into_iter().map(Into::into).collect())
    }
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        self.event_names.contains(record.name()) && self.covers(record)
    }

    /// 记录对应的订阅项；既不匹配、也不需要交付位点时为 `None`
    pub fn entry_for(&self, record: &Record) -> Option<LogEntry> {
        if !self.covers(record) {
            return None;
        }
        if self.event_names.contains(record.name()) {
            Some(LogEntry::Record(record.clone()))
        } else if self.positions {
            Some(LogEntry::Passed {
                stream_id: record.stream_id.clone(),
                sequence: record.sequence,
                time: record.time,
            })
        } else {
            None
        }
    }

    /// 流、时间与位点条件（不看事件名）
    fn covers(&self, record: &Record) -> bool {
        if let Some(stream_id) = &self.stream_id {
            if stream_id != &record.stream_id {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if record.time < *since {
                return false;
            }
        }
        record.sequence > self.after.get(&record.stream_id)
    }
}

/// 事件日志：按过滤条件订阅记录
///
/// 返回的流先按序交付所有已持久化的匹配记录，随后是一个 `LogEntry::CaughtUp`，
/// 再之后是追加产生的实时记录；同一流内按序号升序交付。
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn subscribe(&self, filter: RecordFilter) -> Result<RecordStream>;
}

#[async_trait]
impl<T> EventLog for Arc<T>
where
    T: EventLog + ?Sized,
{
    async fn subscribe(&self, filter: RecordFilter) -> Result<RecordStream> {
        (**self).subscribe(filter).await
    }
}

/// 日志订阅句柄：后台任务逐项消费订阅流，`cancel` 后不再调用处理函数
pub struct LogSubscription {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LogSubscription {
    /// 启动消费任务；处理函数返回 `false` 时结束订阅。
    ///
    /// 上游流意外结束时，处理函数会收到一个 `UnitError::EventLog`。
    pub fn spawn<F, Fut>(mut stream: RecordStream, mut handler: F) -> Self
    where
        F: FnMut(Result<LogEntry>) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    item = stream.next() => match item {
                        Some(item) => {
                            if !handler(item).await {
                                break;
                            }
                        }
                        None => {
                            let ended = UnitError::EventLog {
                                reason: "subscription stream ended".into(),
                            };
                            handler(Err(ended)).await;
                            break;
                        }
                    },
                }
            }
        });

        Self {
            token,
            task: Some(task),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 取消并等待后台任务结束
    pub async fn join(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Event;

    fn record(name: &str, stream: &str, sequence: u64) -> Record {
        Record::new(
            Event::new(name, serde_json::Value::Null),
            stream,
            sequence,
            "t-1",
            Utc::now(),
        )
    }

    #[test]
    fn filter_selects_names_stream_and_position() {
        let filter = RecordFilter::builder()
            .event_names(["food"])
            .stream_id("foo")
            .after(Heads::single("foo", 2))
            .build();

        assert!(filter.matches(&record("food", "foo", 3)));
        assert!(!filter.matches(&record("food", "foo", 2)));
        assert!(!filter.matches(&record("drink", "foo", 3)));
        assert!(!filter.matches(&record("food", "bar", 3)));
    }

    #[test]
    fn positions_are_delivered_for_filtered_out_records() {
        let filter = RecordFilter::builder()
            .event_names(["food"])
            .stream_id("foo")
            .positions(true)
            .build();

        assert!(matches!(filter.entry_for(&record("food", "foo", 1)), Some(LogEntry::Record(_))));
        match filter.entry_for(&record("drink", "foo", 2)) {
            Some(LogEntry::Passed { stream_id, sequence, .. }) => {
                assert_eq!(stream_id, "foo");
                assert_eq!(sequence, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(filter.entry_for(&record("drink", "bar", 2)), None);

        let names_only = RecordFilter::builder().event_names(["food"]).build();
        assert_eq!(names_only.entry_for(&record("drink", "foo", 2)), None);
    }

    #[test]
    fn filter_since_is_inclusive() {
        let at = Utc::now();
        let filter = RecordFilter::builder()
            .event_names(["food"])
            .since(at)
            .build();
        let mut r = record("food", "foo", 1);
        r.time = at;
        assert!(filter.matches(&r));
        r.time = at - chrono::Duration::seconds(1);
        assert!(!filter.matches(&r));
    }
}
