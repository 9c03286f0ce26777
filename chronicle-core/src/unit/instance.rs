//! 单元实例
//!
//! 聚合、投影与 Saga 共用的可重建状态机：
//! 1. `load`：读取快照（失败则回退到种子状态），按已注册事件名订阅日志（聚合与投影同时接收位点），
//!    追平已持久化记录后执行整理钩子；并发调用共享同一次加载；
//! 2. `apply`：按流位点去重，依注册顺序执行匹配的应用器；应用器失败即自卸载；
//! 3. `unload`：取消订阅并通知仓储回收；存在 pin 时推迟到最后一个 pin 释放。
//!
use crate::error::{UnitError, UnitResult};
use crate::message::{Heads, Record, Snapshot};
use crate::persist::{LogEntry, LogSubscription, RecordFilter};
use crate::unit::{
    Evictor, Progress, UnitContext, UnitDefinition, UnitKey, UnitKind, UnitState, UnitStatus,
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{Mutex, OnceCell, RwLock, RwLockReadGuard, mpsc, watch};
use tracing::{debug, error, warn};

pub struct UnitInstance<S> {
    key: UnitKey,
    kind: UnitKind,
    definition: Arc<UnitDefinition<S>>,
    /// 订阅限定的流；聚合只消费自身流
    scope: Option<String>,
    context: UnitContext,
    state: RwLock<S>,
    progress: watch::Sender<Progress>,
    loader: OnceCell<()>,
    subscription: Mutex<Option<LogSubscription>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<()>>>,
    pins: AtomicUsize,
    unload_deferred: AtomicBool,
    torn_down: AtomicBool,
    evictor: OnceLock<Evictor>,
    this: Weak<Self>,
}

impl<S: UnitState> UnitInstance<S> {
    pub fn new(
        kind: UnitKind,
        definition: Arc<UnitDefinition<S>>,
        id: impl Into<String>,
        scope: Option<String>,
        context: UnitContext,
    ) -> Arc<Self> {
        let id = id.into();
        let key = UnitKey::new(definition.name(), id.as_str());
        let seed = definition.seed(&id);

        Arc::new_cyclic(|this| Self {
            key,
            kind,
            definition,
            scope,
            context,
            state: RwLock::new(seed),
            progress: watch::Sender::new(Progress::default()),
            loader: OnceCell::new(),
            subscription: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            pins: AtomicUsize::new(0),
            unload_deferred: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            evictor: OnceLock::new(),
            this: this.clone(),
        })
    }

    pub fn key(&self) -> &UnitKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn definition(&self) -> &Arc<UnitDefinition<S>> {
        &self.definition
    }

    pub fn context(&self) -> &UnitContext {
        &self.context
    }

    pub fn status(&self) -> UnitStatus {
        self.progress.borrow().status
    }

    pub fn heads(&self) -> Heads {
        self.progress.borrow().heads.clone()
    }

    pub fn head(&self, stream_id: &str) -> u64 {
        self.progress.borrow().heads.get(stream_id)
    }

    pub fn last_record_time(&self) -> Option<DateTime<Utc>> {
        self.progress.borrow().last_record_time
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// 只读借用当前状态
    pub async fn read(&self) -> RwLockReadGuard<'_, S> {
        self.state.read().await
    }

    /// 当前状态的副本
    pub async fn state(&self) -> S {
        self.state.read().await.clone()
    }

    pub fn on_unload(&self, evictor: Evictor) {
        if self.evictor.set(evictor).is_err() {
            warn!(unit = %self.key, "evictor already installed");
        }
    }

    /// 加载实例；已加载时立即返回，加载中的并发调用共享同一次加载
    pub async fn load(&self) -> UnitResult<()> {
        if self.status() == UnitStatus::Unloaded {
            return Err(self.unloaded());
        }
        self.loader.get_or_try_init(|| self.reconstruct()).await?;
        Ok(())
    }

    async fn reconstruct(&self) -> UnitResult<()> {
        self.progress.send_modify(|p| p.status = UnitStatus::Loading);
        debug!(unit = %self.key, kind = %self.kind, "loading");

        self.restore_snapshot().await;

        // 聚合与投影需要各流 head 追到流尾，未命中应用器的记录也要推进位点；
        // Saga 的 head 只表示已处理的反应，由协调方推断
        let positions = self.kind != UnitKind::Saga;
        let event_names = self.definition.event_names();
        if event_names.is_empty() && !positions {
            self.progress.send_modify(|p| p.caught_up = true);
        } else {
            let filter = RecordFilter::builder()
                .event_names(event_names)
                .maybe_stream_id(self.scope.clone())
                .after(self.heads())
                .positions(positions)
                .build();

            let stream = match self.context.backend.event_log.subscribe(filter).await {
                Ok(stream) => stream,
                Err(err) => {
                    self.poison(err.to_string()).await;
                    return Err(err);
                }
            };

            let this = self.this.clone();
            let subscription = LogSubscription::spawn(stream, move |entry| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(unit) => unit.on_log_entry(entry).await,
                        None => false,
                    }
                }
            });
            *self.subscription.lock().await = Some(subscription);

            let mut progress = self.progress.subscribe();
            let status = progress
                .wait_for(|p| p.caught_up || p.status == UnitStatus::Unloaded)
                .await
                .map(|p| p.status)
                .unwrap_or(UnitStatus::Unloaded);

            if status == UnitStatus::Unloaded {
                // 订阅可能在句柄登记之前就已失败
                self.teardown().await;
                return Err(self.unloaded());
            }
        }

        {
            let mut state = self.state.write().await;
            let heads = self.heads();
            self.definition.consolidate(&mut state, &heads);
        }

        self.progress.send_modify(|p| p.status = UnitStatus::Loaded);
        debug!(unit = %self.key, heads = ?self.heads(), "loaded");
        Ok(())
    }

    /// 快照缺失、读取失败或与当前状态类型不兼容时，都从种子状态重建
    async fn restore_snapshot(&self) {
        let key = self.key.to_string();
        let version = self.definition.version().as_str();

        let snapshot = match self.context.backend.snapshot_store.fetch(&key, version).await {
            Ok(snapshot) => snapshot,
            Err(err) if err.is_not_found() => {
                debug!(unit = %self.key, version, "no snapshot");
                return;
            }
            Err(err) => {
                warn!(unit = %self.key, error = %err, "snapshot fetch failed, rebuilding from log");
                return;
            }
        };

        let Snapshot {
            heads,
            last_record_time,
            state,
        } = snapshot;

        match serde_json::from_value::<S>(state) {
            Ok(state) => {
                *self.state.write().await = state;
                self.progress.send_modify(|p| {
                    p.heads = heads;
                    p.last_record_time = last_record_time;
                });
            }
            Err(err) => {
                warn!(unit = %self.key, error = %err, "incompatible snapshot, rebuilding from log");
            }
        }
    }

    async fn on_log_entry(&self, entry: UnitResult<LogEntry>) -> bool {
        match entry {
            Ok(LogEntry::Record(record)) => self.apply(&record).await.is_ok(),
            Ok(LogEntry::Passed {
                stream_id,
                sequence,
                time,
            }) => {
                self.advance_to(&stream_id, sequence, time).await;
                true
            }
            Ok(LogEntry::CaughtUp) => {
                self.progress.send_modify(|p| p.caught_up = true);
                true
            }
            Err(err) => {
                error!(unit = %self.key, error = %err, "event log failed");
                self.poison(err.to_string()).await;
                false
            }
        }
    }

    /// 应用一条记录，返回是否有应用器生效。
    ///
    /// 序号不大于该流 head 的记录直接忽略；应用器失败时实例自卸载并返回错误。
    pub async fn apply(&self, record: &Record) -> UnitResult<bool> {
        let mut state = self.state.write().await;
        if record.sequence <= self.head(&record.stream_id) {
            return Ok(false);
        }

        let mut applied = false;
        for applier in self.definition.appliers(record.name()) {
            if !applier.applies_to(self.id(), record) {
                continue;
            }
            if let Err(err) = applier.apply(&mut state, record) {
                drop(state);
                let reason = format!("{err:#}");
                error!(
                    unit = %self.key,
                    event = record.name(),
                    stream = %record.stream_id,
                    sequence = record.sequence,
                    error = %reason,
                    "applier failed, unloading"
                );
                self.poison(reason.clone()).await;
                return Err(UnitError::Applier {
                    unit: self.key.to_string(),
                    event: record.name().to_string(),
                    reason,
                });
            }
            applied = true;
        }

        self.progress.send_modify(|p| {
            p.heads.advance(&record.stream_id, record.sequence);
            if p.last_record_time.is_none_or(|t| t < record.time) {
                p.last_record_time = Some(record.time);
            }
        });
        drop(state);

        if applied {
            self.notify_listeners().await;
        }
        Ok(applied)
    }

    /// 不经应用器直接推进流位点（Saga 在反应完成或终止后调用）
    pub async fn advance(&self, record: &Record) -> bool {
        self.advance_to(&record.stream_id, record.sequence, record.time)
            .await
    }

    async fn advance_to(&self, stream_id: &str, sequence: u64, time: DateTime<Utc>) -> bool {
        let _state = self.state.write().await;
        let mut advanced = false;
        self.progress.send_if_modified(|p| {
            advanced = p.heads.advance(stream_id, sequence);
            if advanced && p.last_record_time.is_none_or(|t| t < time) {
                p.last_record_time = Some(time);
            }
            advanced
        });
        advanced
    }

    /// 合并外部已知的位点（逐流取较大值）
    pub async fn merge_heads(&self, heads: &Heads) {
        let _state = self.state.write().await;
        self.progress.send_modify(|p| p.heads.merge(heads));
    }

    /// 持久化 `{heads, last_record_time, state}`；状态与位点在同一读锁内取得
    pub async fn take_snapshot(&self) -> UnitResult<()> {
        let snapshot = {
            let state = self.state.read().await;
            let progress = self.progress.borrow().clone();
            Snapshot::new(progress.heads, serde_json::to_value(&*state)?)
                .with_last_record_time(progress.last_record_time)
        };

        self.context
            .backend
            .snapshot_store
            .store(
                &self.key.to_string(),
                self.definition.version().as_str(),
                snapshot,
            )
            .await?;

        debug!(unit = %self.key, "snapshot taken");
        Ok(())
    }

    /// 等待各流位点不低于 `required`
    ///
    /// 实例在此期间卸载，或超过 `UnitContext::causal_timeout` 仍未追上，都返回错误。
    pub async fn wait_for_heads(&self, required: &Heads) -> UnitResult<()> {
        if required.is_empty() {
            return Ok(());
        }

        let mut progress = self.progress.subscribe();
        let wait = progress.wait_for(|p| p.status == UnitStatus::Unloaded || p.heads.covers(required));
        let covered = match tokio::time::timeout(self.context.causal_timeout, wait).await {
            Ok(reached) => reached.map(|p| p.heads.covers(required)).unwrap_or(false),
            Err(_) => {
                warn!(unit = %self.key, ?required, heads = ?self.heads(), "timed out waiting for heads");
                return Err(UnitError::CausalTimeout {
                    unit: self.key.to_string(),
                    heads: format!("{required:?}"),
                });
            }
        };

        if covered {
            Ok(())
        } else {
            Err(self.unloaded())
        }
    }

    /// 登记一个状态变更监听者；每次有应用器生效都会收到一次通知，卸载时通道关闭
    pub async fn listen(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.status() != UnitStatus::Unloaded {
            self.listeners.lock().await.push(tx);
        }
        rx
    }

    async fn notify_listeners(&self) {
        self.listeners
            .lock()
            .await
            .retain(|listener| listener.send(()).is_ok());
    }

    /// 阻止卸载，直到对应的 `unpin`
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn unpin(&self) {
        let previous = self.pins.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.unload_deferred.load(Ordering::SeqCst) {
            debug!(unit = %self.key, "last pin released, running deferred unload");
            self.teardown().await;
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    /// 卸载实例；仍被 pin 时只做标记
    pub async fn unload(&self) {
        self.unload_deferred.store(true, Ordering::SeqCst);
        if self.is_pinned() {
            debug!(unit = %self.key, "unload deferred");
            return;
        }
        self.teardown().await;
    }

    async fn poison(&self, reason: String) {
        self.progress.send_modify(|p| p.failure = Some(reason));
        self.teardown().await;
    }

    async fn teardown(&self) {
        let first = !self.torn_down.swap(true, Ordering::SeqCst);
        self.progress.send_modify(|p| p.status = UnitStatus::Unloaded);

        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.cancel();
        }
        self.listeners.lock().await.clear();

        if first {
            if let Some(evict) = self.evictor.get() {
                evict();
            }
            debug!(unit = %self.key, "unloaded");
        }
    }

    pub(crate) fn unloaded(&self) -> UnitError {
        match self.progress.borrow().failure.clone() {
            Some(reason) => UnitError::Poisoned {
                unit: self.key.to_string(),
                reason,
            },
            None => UnitError::Unloaded {
                unit: self.key.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::Event;
    use crate::persist::{Backend, EventStore};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Bards {
        bards: Vec<String>,
    }

    fn definition() -> Arc<UnitDefinition<Bards>> {
        Arc::new(
            UnitDefinition::<Bards>::builder("bards", "1")
                .applying("bard", |s, r| {
                    let name = r
                        .event
                        .payload
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("bard payload must be a string"))?;
                    s.bards.push(name.to_string());
                    Ok(())
                })
                .build()
                .unwrap(),
        )
    }

    fn context(backend: Backend) -> UnitContext {
        UnitContext::new(backend, SystemClock::shared())
    }

    fn bard(stream: &str, sequence: u64, name: &str) -> Record {
        Record::new(Event::new("bard", json!(name)), stream, sequence, "t", Utc::now())
    }

    #[tokio::test]
    async fn apply_is_idempotent_per_stream() {
        let unit = UnitInstance::new(
            UnitKind::Projection,
            definition(),
            "all",
            None,
            context(Backend::in_memory()),
        );
        unit.load().await.unwrap();

        assert!(unit.apply(&bard("foo", 1, "one")).await.unwrap());
        assert!(!unit.apply(&bard("foo", 1, "one")).await.unwrap());
        assert!(unit.apply(&bard("bar", 1, "two")).await.unwrap());

        assert_eq!(unit.state().await.bards, vec!["one", "two"]);
        assert_eq!(unit.heads(), Heads::from([("foo", 1), ("bar", 1)]));
    }

    #[tokio::test]
    async fn load_resumes_from_snapshot_and_catches_up() {
        let backend = Backend::in_memory();
        backend
            .snapshot_store
            .store(
                "bards/all",
                "1",
                Snapshot::new(Heads::single("foo", 1), json!({"bards": ["snap"]})),
            )
            .await
            .unwrap();
        backend
            .event_store
            .record(
                vec![Event::new("bard", json!("skipped")), Event::new("bard", json!("one"))],
                "foo",
                0,
                "t",
            )
            .await
            .unwrap();

        let unit = UnitInstance::new(
            UnitKind::Projection,
            definition(),
            "all",
            None,
            context(backend),
        );
        unit.load().await.unwrap();

        assert_eq!(unit.status(), UnitStatus::Loaded);
        assert_eq!(unit.state().await.bards, vec!["snap", "one"]);
        assert_eq!(unit.head("foo"), 2);
    }

    #[tokio::test]
    async fn failing_applier_unloads_the_instance() {
        let backend = Backend::in_memory();
        let unit = UnitInstance::new(
            UnitKind::Projection,
            definition(),
            "all",
            None,
            context(backend),
        );
        unit.load().await.unwrap();

        let poisoned = Record::new(Event::new("bard", json!(42)), "foo", 1, "t", Utc::now());
        let err = unit.apply(&poisoned).await.unwrap_err();
        assert!(matches!(err, UnitError::Applier { .. }));
        assert_eq!(unit.status(), UnitStatus::Unloaded);
        assert!(matches!(
            unit.load().await.unwrap_err(),
            UnitError::Poisoned { .. }
        ));
    }

    #[tokio::test]
    async fn pinned_unload_is_deferred() {
        let unit = UnitInstance::new(
            UnitKind::Projection,
            definition(),
            "all",
            None,
            context(Backend::in_memory()),
        );
        unit.load().await.unwrap();

        unit.pin();
        unit.unload().await;
        assert_eq!(unit.status(), UnitStatus::Loaded);

        unit.unpin().await;
        assert_eq!(unit.status(), UnitStatus::Unloaded);
    }

    #[tokio::test]
    async fn wait_for_heads_resolves_when_live_record_arrives() {
        let backend = Backend::in_memory();
        let unit = UnitInstance::new(
            UnitKind::Projection,
            definition(),
            "all",
            None,
            context(backend.clone()),
        );
        unit.load().await.unwrap();

        let waiter = {
            let unit = unit.clone();
            tokio::spawn(async move { unit.wait_for_heads(&Heads::single("foo", 1)).await })
        };

        backend
            .event_store
            .record(vec![Event::new("bard", json!("one"))], "foo", 0, "t")
            .await
            .unwrap();

        waiter.await.unwrap().unwrap();
        assert_eq!(unit.state().await.bards, vec!["one"]);
    }
}
