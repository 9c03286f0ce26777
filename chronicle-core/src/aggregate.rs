//! 聚合（Aggregate）
//!
//! 约束一个聚合的核心行为：
//! - 执行器（executer）将命令转换为事件（不改变状态）；
//! - 应用器（applier）将事件投影到状态（改变状态）；
//! - 聚合 ID 即其独占的事件流，订阅限定在该流上。
//!
//! 同一聚合实例上的命令经 FIFO 队列串行执行；写入遇到 `OutOfSequence` 时
//! 从“执行器”一步起整体重试，而不仅仅重试写入。
//!
use crate::error::{UnitError, UnitResult};
use crate::message::{Command, Event, Heads, Record};
use crate::retry::RetryPolicy;
use crate::unit::{
    Evictor, SnapshotVersion, Unit, UnitContext, UnitDefinition, UnitDefinitionBuilder,
    UnitInstance, UnitKey, UnitKind, UnitState, UnitStatus,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 命令 → 聚合 ID；返回 `None` 或空串表示无法映射
pub type CommandMapper = Arc<dyn Fn(&Command) -> Option<String> + Send + Sync>;

/// 执行函数：基于当前状态决定产生哪些事件，空列表表示“无效果”
pub type ExecuteFn<S> = Arc<dyn Fn(&S, &Command) -> anyhow::Result<Vec<Event>> + Send + Sync>;

struct Executer<S> {
    mapper: CommandMapper,
    execute: ExecuteFn<S>,
}

impl<S> Clone for Executer<S> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper.clone(),
            execute: self.execute.clone(),
        }
    }
}

/// 聚合定义：单元定义 + 执行器表
pub struct AggregateDefinition<S> {
    unit: Arc<UnitDefinition<S>>,
    executers: Arc<HashMap<String, Executer<S>>>,
}

impl<S> Clone for AggregateDefinition<S> {
    fn clone(&self) -> Self {
        Self {
            unit: self.unit.clone(),
            executers: self.executers.clone(),
        }
    }
}

impl<S: UnitState> AggregateDefinition<S> {
    pub fn builder(
        name: impl Into<String>,
        version: impl Into<SnapshotVersion>,
    ) -> AggregateDefinitionBuilder<S> {
        AggregateDefinitionBuilder {
            unit: UnitDefinition::builder(name, version),
            executers: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn unit(&self) -> &Arc<UnitDefinition<S>> {
        &self.unit
    }

    fn executer(&self, command: &str) -> Option<&Executer<S>> {
        self.executers.get(command)
    }
}

/// `AggregateDefinition` 的构建器
pub struct AggregateDefinitionBuilder<S> {
    unit: UnitDefinitionBuilder<S>,
    executers: HashMap<String, Executer<S>>,
    duplicates: Vec<String>,
}

impl<S: UnitState> AggregateDefinitionBuilder<S> {
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

    pub fn consolidating<F>(mut self, consolidate: F) -> Self
    where
        F: Fn(&mut S, &Heads) + Send + Sync + 'static,
    {
        self.unit = self.unit.consolidating(consolidate);
        self
    }

    /// 注册命令执行器；同名命令重复注册会在 `build()` 时报错
    pub fn executing<M, F>(mut self, command: impl Into<String>, mapper: M, execute: F) -> Self
    where
        M: Fn(&Command) -> Option<String> + Send + Sync + 'static,
        F: Fn(&S, &Command) -> anyhow::Result<Vec<Event>> + Send + Sync + 'static,
    {
        let command = command.into();
        if self.executers.contains_key(&command) {
            self.duplicates.push(command);
            return self;
        }
        self.executers.insert(
            command,
            Executer {
                mapper: Arc::new(mapper),
                execute: Arc::new(execute),
            },
        );
        self
    }

    pub fn build(self) -> UnitResult<AggregateDefinition<S>> {
        if let Some(name) = self.duplicates.into_iter().next() {
            return Err(UnitError::DuplicateRegistration {
                definition: self.unit.name().to_string(),
                name,
            });
        }

        Ok(AggregateDefinition {
            unit: Arc::new(self.unit.build()?),
            executers: Arc::new(self.executers),
        })
    }
}

/// 类型擦除后的聚合实例
#[async_trait]
pub trait AggregateUnit: Unit {
    /// 执行命令并返回已持久化的记录；无效果时返回空列表
    async fn execute(&self, command: &Command) -> UnitResult<Vec<Record>>;
}

/// 类型擦除后的聚合定义，供 Domain 路由与实例化
pub trait AggregateKind: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn version(&self) -> &SnapshotVersion;

    fn command_names(&self) -> BTreeSet<String>;

    fn can_execute(&self, command: &str) -> bool;

    fn map_to_id(&self, command: &Command) -> UnitResult<String>;

    fn instantiate(
        &self,
        id: &str,
        context: &UnitContext,
        retry: &RetryPolicy,
    ) -> Arc<dyn AggregateUnit>;
}

impl<S: UnitState> AggregateKind for AggregateDefinition<S> {
    fn name(&self) -> &str {
        self.unit.name()
    }

    fn version(&self) -> &SnapshotVersion {
        self.unit.version()
    }

    fn command_names(&self) -> BTreeSet<String> {
        self.executers.keys().cloned().collect()
    }

    fn can_execute(&self, command: &str) -> bool {
        self.executers.contains_key(command)
    }

    fn map_to_id(&self, command: &Command) -> UnitResult<String> {
        self.executer(&command.name)
            .and_then(|executer| (executer.mapper)(command))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UnitError::CannotMap {
                message: command.name.clone(),
            })
    }

    fn instantiate(
        &self,
        id: &str,
        context: &UnitContext,
        retry: &RetryPolicy,
    ) -> Arc<dyn AggregateUnit> {
        Aggregate::new(self.clone(), id, context.clone(), retry.clone())
    }
}

/// 聚合实例
pub struct Aggregate<S> {
    definition: AggregateDefinition<S>,
    instance: Arc<UnitInstance<S>>,
    /// 命令队列：tokio 的 Mutex 按到达顺序唤醒等待者
    queue: Mutex<()>,
    retry: RetryPolicy,
}

impl<S: UnitState> Aggregate<S> {
    pub fn new(
        definition: AggregateDefinition<S>,
        id: impl Into<String>,
        context: UnitContext,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let id = id.into();
        let instance = UnitInstance::new(
            UnitKind::Aggregate,
            definition.unit.clone(),
            id.as_str(),
            Some(id.clone()),
            context,
        );

        Arc::new(Self {
            definition,
            instance,
            queue: Mutex::new(()),
            retry,
        })
    }

    pub fn id(&self) -> &str {
        self.instance.id()
    }

    /// 当前状态的副本
    pub async fn state(&self) -> S {
        self.instance.state().await
    }

    /// 自身流的 head，即下一次写入的乐观并发令牌
    pub fn head(&self) -> u64 {
        self.instance.head(self.id())
    }

    pub async fn execute(&self, command: &Command) -> UnitResult<Vec<Record>> {
        let key = self.instance.key().to_string();
        let executer = self
            .definition
            .executer(&command.name)
            .cloned()
            .ok_or_else(|| UnitError::CannotHandle {
                unit: key.clone(),
                message: command.name.clone(),
            })?;

        let _turn = self.queue.lock().await;
        let store = self.instance.context().backend.event_store.clone();

        let mut attempt = 1;
        loop {
            self.instance.load().await?;

            let (events, on_sequence) = {
                let state = self.instance.read().await;
                let on_sequence = self.head();
                let events = (executer.execute)(&*state, command)
                    .map_err(|err| UnitError::from_handler(&key, &command.name, err))?;
                (events, on_sequence)
            };

            if events.is_empty() {
                debug!(unit = %key, command = %command.name, "no effect");
                return Ok(Vec::new());
            }

            let now = self.instance.context().clock.now();
            let events = events.into_iter().map(|event| event.stamped(now)).collect();

            match store
                .record(events, self.id(), on_sequence, &command.trace_id)
                .await
            {
                Ok(records) => {
                    for record in &records {
                        self.instance.apply(record).await?;
                    }
                    return Ok(records);
                }
                Err(UnitError::OutOfSequence {
                    stream_id,
                    expected,
                    actual,
                }) if self.retry.has_attempts_left(attempt) => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        unit = %key,
                        command = %command.name,
                        attempt,
                        expected,
                        actual,
                        ?delay,
                        "write conflict, retrying command"
                    );
                    tokio::time::sleep(delay).await;

                    // 等待订阅把并发写入的记录带回来，再基于新状态重新执行
                    let caught_up = Heads::single(stream_id, actual);
                    let wait = self.instance.wait_for_heads(&caught_up);
                    if tokio::time::timeout(self.retry.max_delay, wait).await.is_err() {
                        warn!(unit = %key, actual, "timed out waiting for concurrent write");
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<S: UnitState> Unit for Aggregate<S> {
    fn key(&self) -> &UnitKey {
        self.instance.key()
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Aggregate
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
impl<S: UnitState> AggregateUnit for Aggregate<S> {
    async fn execute(&self, command: &Command) -> UnitResult<Vec<Record>> {
        Aggregate::execute(self, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::Rejection;
    use crate::persist::Backend;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Pantry {
        foods: Vec<String>,
    }

    fn definition() -> AggregateDefinition<Pantry> {
        AggregateDefinition::<Pantry>::builder("pantry", "1")
            .executing(
                "Foo",
                |c| c.payload.as_str().map(str::to_string),
                |_, c| Ok(vec![Event::new("food", c.payload.clone())]),
            )
            .executing(
                "Eat",
                |c| c.payload.as_str().map(str::to_string),
                |s: &Pantry, _| {
                    if s.foods.is_empty() {
                        return Err(Rejection::new("nothing to eat").into());
                    }
                    Ok(vec![])
                },
            )
            .applying("food", |s, r| {
                s.foods.push(r.event.payload.to_string());
                Ok(())
            })
            .build()
            .unwrap()
    }

    fn context() -> UnitContext {
        UnitContext::new(Backend::in_memory(), SystemClock::shared())
    }

    #[tokio::test]
    async fn execute_records_events_on_own_stream() {
        let aggregate = Aggregate::new(definition(), "bar", context(), RetryPolicy::default());

        let records = aggregate.execute(&Command::new("Foo", "bar")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.name, "food");
        assert_eq!(records[0].event.payload, json!("bar"));
        assert_eq!(records[0].stream_id, "bar");
        assert_eq!(records[0].sequence, 1);
        assert_eq!(aggregate.head(), 1);
        assert_eq!(aggregate.state().await.foods.len(), 1);
    }

    #[tokio::test]
    async fn rejections_and_no_effect_are_distinguished() {
        let aggregate = Aggregate::new(definition(), "bar", context(), RetryPolicy::default());

        let err = aggregate.execute(&Command::new("Eat", "bar")).await.unwrap_err();
        assert!(err.is_rejection());

        aggregate.execute(&Command::new("Foo", "bar")).await.unwrap();
        let records = aggregate.execute(&Command::new("Eat", "bar")).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn reloaded_aggregate_resumes_at_stream_tail_without_appliers() {
        let definition = AggregateDefinition::<Pantry>::builder("pinger", "1")
            .executing(
                "Ping",
                |c| c.payload.as_str().map(str::to_string),
                |_, _| Ok(vec![Event::new("pinged", json!(null))]),
            )
            .build()
            .unwrap();
        let context = context();

        let first = Aggregate::new(definition.clone(), "p1", context.clone(), RetryPolicy::default());
        first.execute(&Command::new("Ping", "p1")).await.unwrap();
        first.unload().await;

        let reloaded = Aggregate::new(definition, "p1", context, RetryPolicy::default());
        let records = reloaded.execute(&Command::new("Ping", "p1")).await.unwrap();
        assert_eq!(records[0].sequence, 2);
        assert_eq!(reloaded.head(), 2);
    }

    #[tokio::test]
    async fn reloaded_aggregate_counts_events_it_does_not_apply() {
        let definition = AggregateDefinition::<Pantry>::builder("pantry", "1")
            .executing(
                "Foo",
                |c| c.payload.as_str().map(str::to_string),
                |_, c| {
                    Ok(vec![
                        Event::new("food", c.payload.clone()),
                        Event::new("inspected", json!(null)),
                    ])
                },
            )
            .applying("food", |s, r| {
                s.foods.push(r.event.payload.to_string());
                Ok(())
            })
            .build()
            .unwrap();
        let context = context();

        Aggregate::new(definition.clone(), "bar", context.clone(), RetryPolicy::default())
            .execute(&Command::new("Foo", "bar"))
            .await
            .unwrap();

        let reloaded = Aggregate::new(definition, "bar", context, RetryPolicy::default());
        let records = reloaded.execute(&Command::new("Foo", "bar")).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(reloaded.state().await.foods.len(), 2);
    }

    #[test]
    fn map_to_id_rejects_empty_ids() {
        let definition = definition();
        assert_eq!(definition.map_to_id(&Command::new("Foo", "bar")).unwrap(), "bar");

        let err = definition.map_to_id(&Command::new("Foo", "")).unwrap_err();
        assert_eq!(err.to_string(), "Cannot map [Foo]");
        assert!(definition.map_to_id(&Command::new("Foo", 42)).is_err());
    }

    #[test]
    fn duplicate_executers_fail_at_build() {
        let result = AggregateDefinition::<Pantry>::builder("pantry", "1")
            .executing("Foo", |_| Some("a".into()), |_, _| Ok(vec![]))
            .executing("Foo", |_| Some("a".into()), |_, _| Ok(vec![]))
            .build();
        assert!(matches!(
            result,
            Err(UnitError::DuplicateRegistration { .. })
        ));
    }
}
