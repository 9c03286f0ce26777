//! Saga：对日志记录作出反应
//!
//! Saga 除协调记录外没有自己的持久状态。每次反应前先通过协调方对
//! `(saga_key, stream_id, sequence)` 加锁；加锁被拒说明该记录已在别处处理或正在处理，
//! 直接跳过（同一记录至多成功反应一次）。反应失败按固定延迟阶梯重试，
//! 每次尝试前后重新加锁与解锁；全部尝试失败后记录一条持久的失败，不再自动重试。
//!
use crate::error::{UnitError, UnitResult};
use crate::message::{Heads, Record};
use crate::retry::ReactionRetryPolicy;
use crate::unit::{
    Evictor, RecordMapper, SnapshotVersion, Unit, UnitContext, UnitDefinition, UnitInstance,
    UnitKey, UnitKind, UnitStatus,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// 反应函数：拿到记录的副本，可以执行任意异步副作用（通常是向领域发出命令）
pub type ReactFn = Arc<dyn Fn(Record) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Reactor {
    mapper: RecordMapper,
    react: ReactFn,
}

impl Clone for Reactor {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper.clone(),
            react: self.react.clone(),
        }
    }
}

/// 一次反应的终态失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionFailure {
    pub saga_id: String,
    pub saga_key: String,
    pub record: Record,
    /// 每次尝试的错误描述（含错误链）
    pub errors: Vec<String>,
}

/// 反应结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// 反应成功
    Reacted { attempts: usize },
    /// 记录序号不大于当前 head，已处理过
    Skipped,
    /// 加锁被拒：其他调用方正在处理或已处理
    Locked,
    /// 全部尝试均失败，已记录持久失败
    Failed { attempts: usize },
}

/// 反应加锁协调方（由元领域实现）
#[async_trait]
pub trait ReactionCoordinator: Send + Sync {
    /// 对 `(saga_key, record.stream_id, record.sequence)` 加锁；已被锁定时返回 `UnitError::Rejected`
    async fn lock(&self, saga_key: &str, record: &Record) -> UnitResult<()>;

    /// 释放锁；`completed` 表示本次尝试是否成功
    async fn unlock(&self, saga_key: &str, record: &Record, completed: bool) -> UnitResult<()>;

    /// 记录终态失败
    async fn fail(&self, failure: ReactionFailure) -> UnitResult<()>;

    /// 已确认处理完毕（成功或终态失败）的位点
    async fn heads(&self, saga_key: &str) -> UnitResult<Heads>;
}

/// Saga 定义：名称、快照版本与反应器表
pub struct SagaDefinition {
    unit: Arc<UnitDefinition<()>>,
    reactors: HashMap<String, Reactor>,
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>, version: impl Into<SnapshotVersion>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            version: version.into(),
            reactors: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.unit.name()
    }

    pub fn version(&self) -> &SnapshotVersion {
        self.unit.version()
    }

    pub fn event_names(&self) -> BTreeSet<String> {
        self.reactors.keys().cloned().collect()
    }

    pub fn can_react(&self, event: &str) -> bool {
        self.reactors.contains_key(event)
    }

    pub fn map_to_id(&self, record: &Record) -> UnitResult<String> {
        self.reactors
            .get(record.name())
            .and_then(|reactor| (reactor.mapper)(record))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UnitError::CannotMap {
                message: record.name().to_string(),
            })
    }

    /// 协调记录所用的键：`<saga 名>/<映射 ID>`
    pub fn saga_key(&self, id: &str) -> String {
        UnitKey::new(self.name(), id).to_string()
    }

    pub fn instantiate(
        self: &Arc<Self>,
        id: &str,
        context: &UnitContext,
        coordinator: Arc<dyn ReactionCoordinator>,
        retry: &ReactionRetryPolicy,
    ) -> Arc<Saga> {
        Saga::new(self.clone(), id, context.clone(), coordinator, retry.clone())
    }
}

/// `SagaDefinition` 的构建器
pub struct SagaDefinitionBuilder {
    name: String,
    version: SnapshotVersion,
    reactors: HashMap<String, Reactor>,
    duplicates: Vec<String>,
}

impl SagaDefinitionBuilder {
    /// 注册反应器；`mapper` 决定记录交给哪个 Saga 实例
    pub fn reacting<M, F, Fut>(mut self, event: impl Into<String>, mapper: M, react: F) -> Self
    where
        M: Fn(&Record) -> Option<String> + Send + Sync + 'static,
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let event = event.into();
        if self.reactors.contains_key(&event) {
            self.duplicates.push(event);
            return self;
        }
        let react: ReactFn = Arc::new(move |record| react(record).boxed());
        self.reactors.insert(
            event,
            Reactor {
                mapper: Arc::new(mapper),
                react,
            },
        );
        self
    }

    pub fn build(self) -> UnitResult<SagaDefinition> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(UnitError::DuplicateRegistration {
                definition: self.name,
                name,
            });
        }
        let unit = UnitDefinition::<()>::builder(self.name, self.version).build()?;

        Ok(SagaDefinition {
            unit: Arc::new(unit),
            reactors: self.reactors,
        })
    }
}

/// Saga 实例
pub struct Saga {
    definition: Arc<SagaDefinition>,
    instance: Arc<UnitInstance<()>>,
    coordinator: Arc<dyn ReactionCoordinator>,
    retry: ReactionRetryPolicy,
    saga_key: String,
    resumed: OnceCell<()>,
}

impl Saga {
    pub fn new(
        definition: Arc<SagaDefinition>,
        id: impl Into<String>,
        context: UnitContext,
        coordinator: Arc<dyn ReactionCoordinator>,
        retry: ReactionRetryPolicy,
    ) -> Arc<Self> {
        let id = id.into();
        let saga_key = definition.saga_key(&id);
        let instance = UnitInstance::new(
            UnitKind::Saga,
            definition.unit.clone(),
            id,
            None,
            context,
        );

        Arc::new(Self {
            definition,
            instance,
            coordinator,
            retry,
            saga_key,
            resumed: OnceCell::new(),
        })
    }

    pub fn saga_key(&self) -> &str {
        &self.saga_key
    }

    pub fn head(&self, stream_id: &str) -> u64 {
        self.instance.head(stream_id)
    }

    /// 加载快照位点，并合并协调方推断出的已处理位点
    async fn resume(&self) -> UnitResult<()> {
        self.instance.load().await?;
        self.resumed
            .get_or_try_init(|| async {
                let heads = self.coordinator.heads(&self.saga_key).await?;
                debug!(saga = %self.saga_key, ?heads, "resuming from reaction heads");
                self.instance.merge_heads(&heads).await;
                Ok::<_, UnitError>(())
            })
            .await?;
        Ok(())
    }

    fn reactor_for(&self, record: &Record) -> UnitResult<Reactor> {
        self.definition
            .reactors
            .get(record.name())
            .cloned()
            .ok_or_else(|| UnitError::CannotHandle {
                unit: self.saga_key.clone(),
                message: record.name().to_string(),
            })
    }

    /// 对一条记录作出反应，失败时按重试阶梯重试
    pub async fn react_to(&self, record: &Record) -> UnitResult<ReactionOutcome> {
        let reactor = self.reactor_for(record)?;
        self.resume().await?;

        if record.sequence <= self.head(&record.stream_id) {
            debug!(saga = %self.saga_key, stream = %record.stream_id, sequence = record.sequence, "already reacted");
            return Ok(ReactionOutcome::Skipped);
        }

        let mut errors = Vec::new();
        let attempts = self.retry.attempts();
        for attempt in 1..=attempts {
            match self.attempt(&reactor, record, true).await? {
                Attempt::Locked => {
                    if !errors.is_empty() {
                        // 锁的新持有者负责这条记录的最终结果
                        warn!(
                            saga = %self.saga_key,
                            stream = %record.stream_id,
                            sequence = record.sequence,
                            attempts = errors.len(),
                            ?errors,
                            "reaction taken over by another lock holder"
                        );
                    }
                    return Ok(ReactionOutcome::Locked);
                }
                Attempt::Skipped => return Ok(ReactionOutcome::Skipped),
                Attempt::Done => return Ok(ReactionOutcome::Reacted { attempts: attempt }),
                Attempt::Failed { error, rejected } => {
                    errors.push(error);
                    if rejected || attempt == attempts {
                        break;
                    }
                    self.coordinator.unlock(&self.saga_key, record, false).await?;
                    if let Some(delay) = self.retry.delays.get(attempt - 1) {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }

        let attempts = errors.len();
        self.conclude_failure(record, errors).await?;
        Ok(ReactionOutcome::Failed { attempts })
    }

    /// 对先前失败的记录再尝试一次（不走重试阶梯，也不检查 head）
    pub async fn retry(&self, record: &Record) -> UnitResult<ReactionOutcome> {
        let reactor = self.reactor_for(record)?;
        self.resume().await?;

        match self.attempt(&reactor, record, false).await? {
            Attempt::Locked => Ok(ReactionOutcome::Locked),
            Attempt::Skipped => Ok(ReactionOutcome::Skipped),
            Attempt::Done => Ok(ReactionOutcome::Reacted { attempts: 1 }),
            Attempt::Failed { error, .. } => {
                self.conclude_failure(record, vec![error]).await?;
                Ok(ReactionOutcome::Failed { attempts: 1 })
            }
        }
    }

    /// 加锁后执行一次反应器；`check_head` 时在持锁状态下再确认一次未处理过。
    ///
    /// 成功时先推进 head 再解锁，等锁的重复投递因此一定看到新的 head。
    /// 失败时返回 `Attempt::Failed` 且锁仍被持有，由调用方决定重试或终止。
    async fn attempt(
        &self,
        reactor: &Reactor,
        record: &Record,
        check_head: bool,
    ) -> UnitResult<Attempt> {
        match self.coordinator.lock(&self.saga_key, record).await {
            Ok(()) => {}
            Err(err) if err.is_rejection() => {
                debug!(saga = %self.saga_key, stream = %record.stream_id, sequence = record.sequence, "reaction locked elsewhere");
                return Ok(Attempt::Locked);
            }
            Err(err) => return Err(err),
        }

        if check_head && record.sequence <= self.head(&record.stream_id) {
            self.coordinator.unlock(&self.saga_key, record, false).await?;
            return Ok(Attempt::Skipped);
        }

        match (reactor.react)(record.clone()).await {
            Ok(()) => {
                self.instance.advance(record).await;
                self.coordinator.unlock(&self.saga_key, record, true).await?;
                Ok(Attempt::Done)
            }
            Err(err) => {
                let rejected = err.downcast_ref::<crate::error::Rejection>().is_some();
                warn!(
                    saga = %self.saga_key,
                    event = record.name(),
                    stream = %record.stream_id,
                    sequence = record.sequence,
                    error = %format!("{err:#}"),
                    "reaction attempt failed"
                );
                Ok(Attempt::Failed {
                    error: format!("{err:?}"),
                    rejected,
                })
            }
        }
    }

    /// 终态失败：持锁推进 head 并记录失败，最后解锁
    async fn conclude_failure(&self, record: &Record, errors: Vec<String>) -> UnitResult<()> {
        self.instance.advance(record).await;
        let recorded = self.record_failure(record, errors).await;
        self.coordinator.unlock(&self.saga_key, record, false).await?;
        recorded
    }

    async fn record_failure(&self, record: &Record, errors: Vec<String>) -> UnitResult<()> {
        info!(
            saga = %self.saga_key,
            stream = %record.stream_id,
            sequence = record.sequence,
            attempts = errors.len(),
            "reaction failed, recording failure"
        );
        self.coordinator
            .fail(ReactionFailure {
                saga_id: self.instance.id().to_string(),
                saga_key: self.saga_key.clone(),
                record: record.clone(),
                errors,
            })
            .await
    }
}

enum Attempt {
    Locked,
    /// 等锁期间已被同一实例处理完毕
    Skipped,
    Done,
    /// 反应器返回 `Rejection` 时不再重试
    Failed { error: String, rejected: bool },
}

#[async_trait]
impl Unit for Saga {
    fn key(&self) -> &UnitKey {
        self.instance.key()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Saga
    }

    fn status(&self) -> UnitStatus {
        self.instance.status()
    }

    fn heads(&self) -> Heads {
        self.instance.heads()
    }

    async fn load(&self) -> UnitResult<()> {
        self.resume().await
    }

    async fn take_snapshot(&self) -> UnitResult<()> {
        self.instance.take_snapshot().await
    }

    async fn unload(&self) {
        self.instance.unload().await
    }

    fn on_unload(&self, evictor: Evictor) {
        self.instance.on_unload(evictor)
    }

    fn into_unit(self: Arc<Self>) -> Arc<dyn Unit> {
        self
    }
}
