//! 投影（Projection）
//!
//! 读模型：应用器可以观察任意流上的事件，应答器基于当前状态回答查询。
//! 查询携带 `heads` 时，应答会等到各流位点都不低于请求值（read-your-writes）。
//! `subscribe_to` 在每次有应用器生效后重新应答并推送；存在订阅的实例不会被卸载。
//!
use crate::error::{UnitError, UnitResult};
use crate::message::{Heads, Query, Record};
use crate::unit::{
    Evictor, SnapshotVersion, Unit, UnitContext, UnitDefinition, UnitDefinitionBuilder,
    UnitInstance, UnitKey, UnitKind, UnitState, UnitStatus,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 查询 → 投影 ID；返回 `None` 或空串表示无法映射
pub type QueryMapper = Arc<dyn Fn(&Query) -> Option<String> + Send + Sync>;

/// 订阅者：接收每一次应答结果；实例意外卸载时收到错误并结束
pub type Subscriber = Arc<dyn Fn(UnitResult<Value>) + Send + Sync>;

type SyncRespond<S> = Arc<dyn Fn(&S, &Query) -> anyhow::Result<Value> + Send + Sync>;
type AsyncRespond<S> =
    Arc<dyn Fn(S, Query) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

enum RespondFn<S> {
    Sync(SyncRespond<S>),
    Async(AsyncRespond<S>),
}

struct Responder<S> {
    mapper: QueryMapper,
    respond: RespondFn<S>,
}

impl<S> Clone for Responder<S> {
    fn clone(&self) -> Self {
        let respond = match &self.respond {
            RespondFn::Sync(f) => RespondFn::Sync(f.clone()),
            RespondFn::Async(f) => RespondFn::Async(f.clone()),
        };
        Self {
            mapper: self.mapper.clone(),
            respond,
        }
    }
}

/// 投影定义：单元定义 + 应答器表
pub struct ProjectionDefinition<S> {
    unit: Arc<UnitDefinition<S>>,
    responders: Arc<HashMap<String, Responder<S>>>,
}

impl<S> Clone for ProjectionDefinition<S> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit.clone(),
            responders: self.responders.clone(),
        }
    }
}

impl<S: UnitState> ProjectionDefinition<S> {
    pub fn builder(
        name: impl Into<String>,
        version: impl Into<SnapshotVersion>,
    ) -> ProjectionDefinitionBuilder<S> {
        ProjectionDefinitionBuilder {
            unit: UnitDefinition::builder(name, version),
            responders: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn unit(&self) -> &Arc<UnitDefinition<S>> {
        &self.unit
    }

    fn responder(&self, query: &str) -> Option<&Responder<S>> {
        self.responders.get(query)
    }
}

/// `ProjectionDefinition` 的构建器
pub struct ProjectionDefinitionBuilder<S> {
    unit: UnitDefinitionBuilder<S>,
    responders: HashMap<String, Responder<S>>,
    duplicates: Vec<String>,
}

impl<S: UnitState> ProjectionDefinitionBuilder<S> {
    pub fn initializing<F>(mut self, initialize: F) -> Self
    where
        F: Fn(&mut S, &str) + Send + Sync + 'static,
    {
        self.unit = self.unit.initializing(initialize);
        self
    }

    pub fn applying<F>(mut self, event: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut S, &Record) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.unit = self.unit.applying(event, apply);
        self
    }

    /// 仅当 `mapper(record)` 等于投影 ID 时应用
    pub fn applying_for<M, F>(mut self, event: impl Into<String>, mapper: M, apply: F) -> Self
    where
        M: Fn(&Record) -> Option<String> + Send + Sync + 'static,
        F: Fn(&mut S, &Record) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.unit = self.unit.applying_for(event, mapper, apply);
        self
    }

    pub fn consolidating<F>(mut self, consolidate: F) -> Self
    where
        F: Fn(&mut S, &Heads) + Send + Sync + 'static,
    {
        self.unit = self.unit.consolidating(consolidate);
        self
    }

    /// 注册同步应答器
    pub fn responding<M, F>(self, query: impl Into<String>, mapper: M, respond: F) -> Self
    where
        M: Fn(&Query) -> Option<String> + Send + Sync + 'static,
        F: Fn(&S, &Query) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.push_responder(
            query.into(),
            Arc::new(mapper),
            RespondFn::Sync(Arc::new(respond)),
        )
    }

    /// 注册异步应答器；应答器拿到的是状态副本，不会阻塞应用器
    pub fn responding_async<M, F, Fut>(self, query: impl Into<String>, mapper: M, respond: F) -> Self
    where
        M: Fn(&Query) -> Option<String> + Send + Sync + 'static,
        F: Fn(S, Query) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let respond: AsyncRespond<S> = Arc::new(move |state, query| respond(state, query).boxed());
        self.push_responder(query.into(), Arc::new(mapper), RespondFn::Async(respond))
    }

    fn push_responder(mut self, query: String, mapper: QueryMapper, respond: RespondFn<S>) -> Self {
        if self.responders.contains_key(&query) {
            self.duplicates.push(query);
            return self;
        }
        self.responders.insert(query, Responder { mapper, respond });
        self
    }

    pub fn build(self) -> UnitResult<ProjectionDefinition<S>> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(UnitError::DuplicateRegistration {
                definition: self.unit.name().to_string(),
                name,
            });
        }

        Ok(ProjectionDefinition {
            unit: Arc::new(self.unit.build()?),
            responders: Arc::new(self.responders),
        })
    }
}

/// 订阅句柄：取消后不再推送（已在进行中的推送不受影响），丢弃即取消
#[must_use = "dropping the subscription cancels it"]
pub struct ProjectionSubscription {
    token: CancellationToken,
}

impl ProjectionSubscription {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ProjectionSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 类型擦除后的投影实例
#[async_trait]
pub trait ProjectionUnit: Unit {
    async fn respond_to(&self, query: &Query) -> UnitResult<Value>;

    async fn subscribe_to(
        self: Arc<Self>,
        query: Query,
        subscriber: Subscriber,
    ) -> UnitResult<ProjectionSubscription>;
}

/// 类型擦除后的投影定义
pub trait ProjectionKind: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &SnapshotVersion;

    fn query_names(&self) -> BTreeSet<String>;

    fn can_respond(&self, query: &str) -> bool;

    fn map_to_id(&self, query: &Query) -> UnitResult<String>;

    fn instantiate(&self, id: &str, context: &UnitContext) -> Arc<dyn ProjectionUnit>;
}

impl<S: UnitState> ProjectionKind for ProjectionDefinition<S> {
    fn name(&self) -> &str {
        self.unit.name()
    }

    fn version(&self) -> &SnapshotVersion {
        self.unit.version()
    }

    fn query_names(&self) -> BTreeSet<String> {
        self.responders.keys().cloned().collect()
    }

    fn can_respond(&self, query: &str) -> bool {
        self.responders.contains_key(query)
    }

    fn map_to_id(&self, query: &Query) -> UnitResult<String> {
        self.responder(&query.name)
            .and_then(|responder| (responder.mapper)(query))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UnitError::CannotMap {
                message: query.name.clone(),
            })
    }

    fn instantiate(&self, id: &str, context: &UnitContext) -> Arc<dyn ProjectionUnit> {
        Projection::new(self.clone(), id, context.clone())
    }
}

/// 投影实例
pub struct Projection<S> {
    definition: ProjectionDefinition<S>,
    instance: Arc<UnitInstance<S>>,
}

impl<S: UnitState> Projection<S> {
    pub fn new(
        definition: ProjectionDefinition<S>,
        id: impl Into<String>,
        context: UnitContext,
    ) -> Arc<Self> {
        let instance = UnitInstance::new(
            UnitKind::Projection,
            definition.unit.clone(),
            id,
            None,
            context,
        );
        Arc::new(Self {
            definition,
            instance,
        })
    }

    pub fn instance(&self) -> &Arc<UnitInstance<S>> {
        &self.instance
    }

    /// 当前状态的副本
    pub async fn state(&self) -> S {
        self.instance.state().await
    }

    fn responder_for(&self, query: &Query) -> UnitResult<Responder<S>> {
        self.definition
            .responder(&query.name)
            .cloned()
            .ok_or_else(|| UnitError::CannotHandle {
                unit: self.instance.key().to_string(),
                message: query.name.clone(),
            })
    }

    pub async fn respond_to(&self, query: &Query) -> UnitResult<Value> {
        let responder = self.responder_for(query)?;
        self.instance.load().await?;

        if let Some(heads) = &query.heads {
            debug!(unit = %self.instance.key(), ?heads, "waiting for heads");
            self.instance.wait_for_heads(heads).await?;
        }

        self.respond(&responder, query).await
    }

    async fn respond(&self, responder: &Responder<S>, query: &Query) -> UnitResult<Value> {
        let result = match &responder.respond {
            RespondFn::Sync(respond) => {
                let state = self.instance.read().await;
                respond(&*state, query)
            }
            RespondFn::Async(respond) => {
                let state = self.instance.state().await;
                respond(state, query.clone()).await
            }
        };

        result.map_err(|err| {
            UnitError::from_handler(&self.instance.key().to_string(), &query.name, err)
        })
    }

    /// 先应答一次并推送，此后每当有应用器生效就重新应答并推送。
    ///
    /// 订阅存续期间实例保持 pin，仓储策略发起的卸载会推迟到最后一个订阅取消之后。
    pub async fn subscribe_to(
        self: Arc<Self>,
        query: Query,
        subscriber: Subscriber,
    ) -> UnitResult<ProjectionSubscription> {
        let responder = self.responder_for(&query)?;

        self.instance.pin();
        let mut changes = self.instance.listen().await;
        let initial = match self.respond_to(&query).await {
            Ok(value) => value,
            Err(err) => {
                self.instance.unpin().await;
                return Err(err);
            }
        };
        subscriber(Ok(initial));

        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(()) => {
                            let result = self.respond(&responder, &query).await;
                            if !cancelled.is_cancelled() {
                                subscriber(result);
                            }
                        }
                        None => {
                            subscriber(Err(self.instance.unloaded()));
                            break;
                        }
                    },
                }
            }
            debug!(unit = %self.instance.key(), query = %query.name, "subscription closed");
            self.instance.unpin().await;
        });

        Ok(ProjectionSubscription { token })
    }
}

#[async_trait]
impl<S: UnitState> Unit for Projection<S> {
    fn key(&self) -> &UnitKey {
        self.instance.key()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Projection
    }

    fn status(&self) -> UnitStatus {
        self.instance.status()
    }

    fn heads(&self) -> Heads {
        self.instance.heads()
    }

    async fn load(&self) -> UnitResult<()> {
        self.instance.load().await
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

#[async_trait]
impl<S: UnitState> ProjectionUnit for Projection<S> {
    async fn respond_to(&self, query: &Query) -> UnitResult<Value> {
        Projection::respond_to(self, query).await
    }

    async fn subscribe_to(
        self: Arc<Self>,
        query: Query,
        subscriber: Subscriber,
    ) -> UnitResult<ProjectionSubscription> {
        Projection::subscribe_to(self, query, subscriber).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::message::{Event, Snapshot};
    use crate::persist::{Backend, EventStore, SnapshotStore};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Bards {
        bards: Vec<String>,
    }

    fn definition() -> ProjectionDefinition<Bards> {
        ProjectionDefinition::<Bards>::builder("bards", "1")
            .applying("bard", |s, r| {
                s.bards.push(r.event.payload.as_str().unwrap_or_default().to_string());
                Ok(())
            })
            .responding("Bards", |_| Some("all".into()), |s, _| Ok(json!(s.bards)))
            .responding_async("CountBards", |_| Some("all".into()), |s: Bards, _| async move {
                Ok::<_, anyhow::Error>(json!(s.bards.len()))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn responds_from_snapshot_plus_replayed_records() {
        let backend = Backend::in_memory();
        backend
            .snapshot_store
            .store(
                "bards/all",
                "1",
                Snapshot::new(Heads::single("foo", 21), json!({"bards": ["snap"]})),
            )
            .await
            .unwrap();

        // 1..=22 号是投影不关心的事件，23 号是新的 bard
        let events = (1..=23)
            .map(|n| match n {
                23 => Event::new("bard", json!("one")),
                _ => Event::new("noise", json!(n)),
            })
            .collect();
        backend.event_store.record(events, "foo", 0, "t").await.unwrap();

        let projection = Projection::new(
            definition(),
            "all",
            UnitContext::new(backend, SystemClock::shared()),
        );
        let answer = projection.respond_to(&Query::new("Bards", json!(null))).await.unwrap();

        assert_eq!(answer, json!(["snap", "one"]));
        assert_eq!(projection.instance().head("foo"), 23);
        assert_eq!(
            projection
                .respond_to(&Query::new("CountBards", json!(null)))
                .await
                .unwrap(),
            json!(2)
        );
    }

    #[tokio::test]
    async fn subscription_pushes_on_change_and_defers_unload() {
        let backend = Backend::in_memory();
        let projection = Projection::new(
            definition(),
            "all",
            UnitContext::new(backend.clone(), SystemClock::shared()),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = projection
            .clone()
            .subscribe_to(
                Query::new("Bards", json!(null)),
                Arc::new(move |value| {
                    let _ = tx.send(value);
                }),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), json!([]));

        projection.unload().await;
        assert_eq!(projection.status(), UnitStatus::Loaded);

        backend
            .event_store
            .record(vec![Event::new("bard", json!("one"))], "foo", 0, "t")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), json!(["one"]));

        subscription.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while projection.status() != UnitStatus::Unloaded {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn causal_reads_resolve_on_records_without_appliers() {
        let backend = Backend::in_memory();
        let projection = Projection::new(
            definition(),
            "all",
            UnitContext::new(backend.clone(), SystemClock::shared()),
        );
        projection.load().await.unwrap();

        backend
            .event_store
            .record(
                vec![Event::new("bard", json!("one")), Event::new("noise", json!(2))],
                "foo",
                0,
                "t",
            )
            .await
            .unwrap();

        let query = Query::new("Bards", json!(null)).with_heads(Heads::single("foo", 2));
        let answer = tokio::time::timeout(Duration::from_secs(1), projection.respond_to(&query))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, json!(["one"]));
    }

    #[tokio::test]
    async fn causal_reads_beyond_the_log_time_out() {
        let projection = Projection::new(
            definition(),
            "all",
            UnitContext::new(Backend::in_memory(), SystemClock::shared())
                .with_causal_timeout(Duration::from_millis(20)),
        );

        let query = Query::new("Bards", json!(null)).with_heads(Heads::single("foo", 1));
        let err = projection.respond_to(&query).await.unwrap_err();
        assert!(matches!(err, UnitError::CausalTimeout { .. }));
        assert_eq!(projection.status(), UnitStatus::Loaded);
    }

    #[tokio::test]
    async fn unknown_query_cannot_be_handled() {
        let projection = Projection::new(
            definition(),
            "all",
            UnitContext::new(Backend::in_memory(), SystemClock::shared()),
        );
        let err = projection
            .respond_to(&Query::new("Nope", json!(null)))
            .await
            .unwrap_err();
        assert!(err.is_mapping());
    }
}
