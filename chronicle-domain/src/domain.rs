//! 领域（Domain）
//!
//! 把一组单元定义、一个持久化后端与三个实例仓储组装在一起，对外只暴露四个入口：
//! `execute`、`respond_to`、`subscribe_to` 与 `react_to`。
//!
//! - 每个入口都在带有 `trace_id` 的 span 中运行，按结果分级记录日志；
//! - 实例在处理途中被策略卸载时，重新获取实例后再试；
//! - 注册了 Saga 的领域会创建一个元领域保存反应协调记录，`start` 之后
//!   后台订阅会把新记录与重试请求交给对应的 Saga。
//!
use crate::config::DomainConfig;
use crate::error::{DomainError, DomainResult, ErrorKind};
use crate::feed;
use crate::meta::MetaDomain;
use crate::meta::vocabulary::{REACTION_RETRY_REQUESTED, RetryRequest};
use crate::routing::Routes;
use chronicle_core::aggregate::AggregateUnit;
use chronicle_core::clock::{Clock, SystemClock};
use chronicle_core::error::{UnitError, UnitResult};
use chronicle_core::kind::Definition;
use chronicle_core::message::{Command, Query, Record};
use chronicle_core::persist::{Backend, LogSubscription, RecordFilter};
use chronicle_core::projection::{ProjectionSubscription, ProjectionUnit, Subscriber};
use chronicle_core::repository::{KeepStrategy, Strategy, UnitRepository};
use chronicle_core::saga::{ReactionCoordinator, ReactionFailure, ReactionOutcome, Saga, SagaDefinition};
use chronicle_core::unit::{UnitContext, UnitKey, UnitKind};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};

pub struct Domain {
    name: String,
    context: UnitContext,
    routes: Routes,
    config: DomainConfig,
    aggregates: UnitRepository<dyn AggregateUnit>,
    projections: UnitRepository<dyn ProjectionUnit>,
    sagas: UnitRepository<Saga>,
    meta: Option<Arc<MetaDomain>>,
    feeds: Mutex<Vec<LogSubscription>>,
}

#[bon::bon]
impl Domain {
    /// 构建领域；重复的定义名或重复的命令/查询处理者会在这里报错
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        backend: Backend,
        #[builder(default)] definitions: Vec<Definition>,
        // 注册了 Saga 却未提供时退回内存后端
        meta_backend: Option<Backend>,
        clock: Option<Arc<dyn Clock>>,
        #[builder(default)] config: DomainConfig,
        aggregate_strategy: Option<Arc<dyn Strategy>>,
        projection_strategy: Option<Arc<dyn Strategy>>,
        saga_strategy: Option<Arc<dyn Strategy>>,
    ) -> DomainResult<Self> {
        let clock = clock.unwrap_or_else(SystemClock::shared);
        let routes = Routes::new(definitions)?;

        let meta = if routes.has_sagas() {
            let meta_backend = meta_backend.unwrap_or_else(|| {
                warn!(domain = %name, "no meta backend configured, reaction locks are kept in memory");
                Backend::in_memory()
            });
            let meta = MetaDomain::new(&name, meta_backend, clock.clone(), config.clone())?;
            Some(Arc::new(meta))
        } else {
            None
        };

        let keep = || -> Arc<dyn Strategy> { Arc::new(KeepStrategy) };

        Ok(Self {
            context: UnitContext::new(backend, clock).with_causal_timeout(config.causal_timeout),
            routes,
            aggregates: UnitRepository::new(
                UnitKind::Aggregate,
                aggregate_strategy.unwrap_or_else(keep),
            ),
            projections: UnitRepository::new(
                UnitKind::Projection,
                projection_strategy.unwrap_or_else(keep),
            ),
            sagas: UnitRepository::new(UnitKind::Saga, saga_strategy.unwrap_or_else(keep)),
            meta,
            feeds: Mutex::new(Vec::new()),
            config,
            name,
        })
    }
}

impl Domain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &UnitContext {
        &self.context
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn definitions(&self) -> &[Definition] {
        self.routes.definitions()
    }

    /// 元领域；没有注册 Saga 时为 `None`
    pub fn meta(&self) -> Option<&Arc<MetaDomain>> {
        self.meta.as_ref()
    }

    /// 执行命令，返回已持久化的记录；命令无效果时返回空列表
    pub async fn execute(&self, command: Command) -> DomainResult<Vec<Record>> {
        let span = info_span!(
            "execute",
            domain = %self.name,
            trace_id = %command.trace_id,
            command = %command.name,
        );

        async {
            let result = self.try_execute(&command).await;
            match &result {
                Ok(records) => info!(records = records.len(), "command executed"),
                Err(err) => log_failure(err.kind(), err),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn try_execute(&self, command: &Command) -> DomainResult<Vec<Record>> {
        let definition = self.routes.aggregate_for(&command.name)?;
        let id = definition.map_to_id(command)?;
        let key = UnitKey::new(definition.name(), id.as_str());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let unit = self
                .aggregates
                .get_or_load(key.clone(), || {
                    definition.instantiate(&id, &self.context, &self.config.write_retry)
                })
                .await?;

            match unit.execute(command).await {
                Ok(records) => {
                    self.aggregates.accessed(&unit).await;
                    return Ok(records);
                }
                Err(UnitError::Unloaded { .. }) if attempt < self.config.reload_attempts => {
                    debug!(unit = %key, attempt, "unit unloaded mid-flight, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// 应答查询；查询携带 `heads` 时等待投影追上后再应答
    pub async fn respond_to(&self, query: Query) -> DomainResult<Value> {
        let span = info_span!(
            "respond_to",
            domain = %self.name,
            trace_id = %query.trace_id,
            query = %query.name,
        );

        async {
            let result = self.try_respond(&query).await;
            match &result {
                Ok(_) => info!("query answered"),
                Err(err) => log_failure(err.kind(), err),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn try_respond(&self, query: &Query) -> DomainResult<Value> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let unit = self.projection_for(query).await?;

            match unit.respond_to(query).await {
                Ok(value) => {
                    self.projections.accessed(&unit).await;
                    return Ok(value);
                }
                Err(UnitError::Unloaded { .. }) if attempt < self.config.reload_attempts => {
                    debug!(unit = %unit.key(), attempt, "unit unloaded mid-flight, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// 订阅查询结果：先推送一次当前结果，之后投影状态每次变化都重新推送
    ///
    /// 投影被卸载时订阅者会收到一个错误，之后不再推送。返回的句柄被丢弃即取消订阅。
    pub async fn subscribe_to<F>(
        &self,
        query: Query,
        subscriber: F,
    ) -> DomainResult<ProjectionSubscription>
    where
        F: Fn(DomainResult<Value>) + Send + Sync + 'static,
    {
        let span = info_span!(
            "subscribe_to",
            domain = %self.name,
            trace_id = %query.trace_id,
            query = %query.name,
        );

        let subscriber: Subscriber = Arc::new(move |result: UnitResult<Value>| {
            subscriber(result.map_err(DomainError::from))
        });

        async {
            let result = self.try_subscribe(query, subscriber).await;
            match &result {
                Ok(_) => info!("query subscribed"),
                Err(err) => log_failure(err.kind(), err),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn try_subscribe(
        &self,
        query: Query,
        subscriber: Subscriber,
    ) -> DomainResult<ProjectionSubscription> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let unit = self.projection_for(&query).await?;

            match unit
                .clone()
                .subscribe_to(query.clone(), subscriber.clone())
                .await
            {
                Ok(subscription) => {
                    self.projections.accessed(&unit).await;
                    return Ok(subscription);
                }
                Err(UnitError::Unloaded { .. }) if attempt < self.config.reload_attempts => {
                    debug!(unit = %unit.key(), attempt, "unit unloaded mid-flight, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn projection_for(&self, query: &Query) -> DomainResult<Arc<dyn ProjectionUnit>> {
        let definition = self.routes.projection_for(&query.name)?;
        let id = definition.map_to_id(query)?;
        let key = UnitKey::new(definition.name(), id.as_str());

        Ok(self
            .projections
            .get_or_load(key, || definition.instantiate(&id, &self.context))
            .await?)
    }

    /// 把一条记录交给所有订阅了该事件的 Saga
    ///
    /// 映射不出 ID 的 Saga 直接跳过；没有注册 Saga 时返回空列表。
    pub async fn react_to(&self, record: &Record) -> DomainResult<Vec<ReactionOutcome>> {
        let span = info_span!(
            "react_to",
            domain = %self.name,
            trace_id = %record.trace_id,
            event = %record.name(),
            stream = %record.stream_id,
            sequence = record.sequence,
        );

        async {
            let result = self.try_react(record).await;
            match &result {
                Ok(outcomes) => debug!(?outcomes, "record dispatched to sagas"),
                Err(err) => log_failure(err.kind(), err),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn try_react(&self, record: &Record) -> DomainResult<Vec<ReactionOutcome>> {
        let mut outcomes = Vec::new();

        for definition in self.routes.sagas_for(record.name()) {
            let id = match definition.map_to_id(record) {
                Ok(id) => id,
                Err(err) => {
                    debug!(saga = definition.name(), error = %err, "record not mapped, skipping");
                    continue;
                }
            };

            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                let saga = self.saga(definition, &id).await?;

                match saga.react_to(record).await {
                    Ok(outcome) => {
                        self.sagas.accessed(&saga).await;
                        break outcome;
                    }
                    Err(UnitError::Unloaded { .. }) if attempt < self.config.reload_attempts => {
                        debug!(saga = saga.saga_key(), attempt, "saga unloaded mid-flight, reloading");
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn saga(&self, definition: &Arc<SagaDefinition>, id: &str) -> DomainResult<Arc<Saga>> {
        let coordinator = self.coordinator()?;
        let key = UnitKey::new(definition.name(), id);

        Ok(self
            .sagas
            .get_or_load(key, || {
                definition.instantiate(id, &self.context, coordinator, &self.config.reaction_retry)
            })
            .await?)
    }

    fn coordinator(&self) -> DomainResult<Arc<dyn ReactionCoordinator>> {
        let meta: Arc<dyn ReactionCoordinator> = self.meta_domain()?.clone();
        Ok(meta)
    }

    fn meta_domain(&self) -> DomainResult<&Arc<MetaDomain>> {
        self.meta.as_ref().ok_or_else(|| DomainError::Meta {
            reason: format!("domain {} has no sagas", self.name),
        })
    }

    /// 请求对一条终态失败的记录重试一次
    ///
    /// 请求先写入元领域，由 `start` 启动的重试订阅交给对应的 Saga 执行。
    pub async fn retry_reaction(&self, saga: &str, record: &Record) -> DomainResult<()> {
        let definition = self.routes.saga(saga)?;
        let id = definition.map_to_id(record)?;
        let meta = self.meta_domain()?;

        info!(domain = %self.name, saga, stream = %record.stream_id, sequence = record.sequence, "requesting reaction retry");
        meta.request_retry(RetryRequest {
            saga: saga.to_string(),
            saga_key: definition.saga_key(&id),
            saga_id: id,
            record: record.clone(),
        })
        .await
    }

    /// 执行一条重试请求：只尝试一次，再次失败时重新记录终态失败
    pub(crate) async fn run_retry(&self, request: &RetryRequest) -> DomainResult<ReactionOutcome> {
        let span = info_span!(
            "retry_reaction",
            domain = %self.name,
            trace_id = %request.record.trace_id,
            saga = %request.saga_key,
        );

        async {
            let definition = self.routes.saga(&request.saga)?;
            let saga = self.saga(&definition, &request.saga_id).await?;
            let outcome = saga.retry(&request.record).await?;
            self.sagas.accessed(&saga).await;
            info!(?outcome, "reaction retried");
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// 尚未被成功重试消解的终态失败
    pub async fn failed_reactions(&self) -> DomainResult<Vec<ReactionFailure>> {
        match &self.meta {
            Some(meta) => meta.failed_reactions().await,
            None => Ok(Vec::new()),
        }
    }

    /// 启动 Saga 的后台订阅；重复调用是空操作
    ///
    /// - 主日志：从最近一次加锁的记录时间起（含）订阅 Saga 关心的事件；
    /// - 元日志：从现在起订阅重试请求。
    pub async fn start(self: &Arc<Self>) -> DomainResult<()> {
        let Some(meta) = self.meta.clone() else {
            debug!(domain = %self.name, "no sagas registered, nothing to start");
            return Ok(());
        };

        let mut feeds = self.feeds.lock().await;
        if !feeds.is_empty() {
            return Ok(());
        }

        let since = meta.last_consumed_time().await?;
        info!(domain = %self.name, ?since, "starting saga feed");

        let filter = RecordFilter::builder()
            .event_names(self.routes.reaction_names())
            .maybe_since(since)
            .build();
        let stream = self.context.backend.event_log.subscribe(filter).await?;
        feeds.push(feed::reactions(Arc::downgrade(self), stream));

        let filter = RecordFilter::builder()
            .event_names([REACTION_RETRY_REQUESTED])
            .since(self.context.clock.now())
            .build();
        let stream = meta.backend().event_log.subscribe(filter).await?;
        feeds.push(feed::retries(Arc::downgrade(self), stream));

        Ok(())
    }

    /// 停止后台订阅并等待正在处理的记录完成
    pub async fn stop(&self) {
        let feeds: Vec<LogSubscription> = self.feeds.lock().await.drain(..).collect();
        if feeds.is_empty() {
            return;
        }
        info!(domain = %self.name, "stopping saga feeds");
        for feed in feeds {
            feed.join().await;
        }
    }

    /// 卸载全部实例
    pub async fn unload(&self) {
        self.aggregates.clear().await;
        self.projections.clear().await;
        self.sagas.clear().await;
    }
}

/// 按错误分类记录日志：拒绝是正常业务结果，路由/映射失败是调用方问题，其余为内部错误
fn log_failure(kind: ErrorKind, err: &DomainError) {
    match kind {
        ErrorKind::Rejection => info!(error = %err, "rejected"),
        ErrorKind::Mapping | ErrorKind::Routing => warn!(error = %err, ?kind, "not handled"),
        ErrorKind::Internal => error!(error = %err, "failed"),
    }
}
