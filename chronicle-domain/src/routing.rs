//! 消息路由表
//!
//! 构建时按消息名登记处理者：
//! - 命令 → 恰好一个聚合定义；
//! - 查询 → 恰好一个投影定义；
//! - 事件 → 零到多个 Saga 定义。
//!
//! 重复登记在构建时报错，运行时只做查表。
//!
use crate::error::{DomainError, DomainResult};
use chronicle_core::aggregate::AggregateKind;
use chronicle_core::kind::Definition;
use chronicle_core::projection::ProjectionKind;
use chronicle_core::saga::SagaDefinition;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

#[derive(Clone, Default)]
pub(crate) struct Routes {
    definitions: Vec<Definition>,
    commands: HashMap<String, Arc<dyn AggregateKind>>,
    queries: HashMap<String, Arc<dyn ProjectionKind>>,
    reactions: HashMap<String, Vec<Arc<SagaDefinition>>>,
    sagas: HashMap<String, Arc<SagaDefinition>>,
}

impl Routes {
    pub(crate) fn new(definitions: Vec<Definition>) -> DomainResult<Self> {
        let mut routes = Routes::default();
        let mut names = HashSet::new();

        for definition in &definitions {
            if !names.insert(definition.name().to_string()) {
                return Err(DomainError::DuplicateDefinition {
                    name: definition.name().to_string(),
                });
            }

            match definition {
                Definition::Aggregate(aggregate) => {
                    for command in aggregate.command_names() {
                        if let Some(first) = routes.commands.get(&command) {
                            return Err(duplicate(command, first.name(), aggregate.name()));
                        }
                        routes.commands.insert(command, aggregate.clone());
                    }
                }
                Definition::Projection(projection) => {
                    for query in projection.query_names() {
                        if let Some(first) = routes.queries.get(&query) {
                            return Err(duplicate(query, first.name(), projection.name()));
                        }
                        routes.queries.insert(query, projection.clone());
                    }
                }
                Definition::Saga(saga) => {
                    for event in saga.event_names() {
                        routes.reactions.entry(event).or_default().push(saga.clone());
                    }
                    routes.sagas.insert(saga.name().to_string(), saga.clone());
                }
            }
        }

        routes.definitions = definitions;
        Ok(routes)
    }

    pub(crate) fn definitions(&self) -> &[Definition] {
        &self.definitions
    }

    pub(crate) fn aggregate_for(&self, command: &str) -> DomainResult<Arc<dyn AggregateKind>> {
        self.commands
            .get(command)
            .cloned()
            .ok_or_else(|| DomainError::CannotHandle {
                message: command.to_string(),
            })
    }

    pub(crate) fn projection_for(&self, query: &str) -> DomainResult<Arc<dyn ProjectionKind>> {
        self.queries
            .get(query)
            .cloned()
            .ok_or_else(|| DomainError::CannotHandle {
                message: query.to_string(),
            })
    }

    /// 对该事件作出反应的全部 Saga；没有时返回空列表
    pub(crate) fn sagas_for(&self, event: &str) -> &[Arc<SagaDefinition>] {
        self.reactions
            .get(event)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn saga(&self, name: &str) -> DomainResult<Arc<SagaDefinition>> {
        self.sagas
            .get(name)
            .cloned()
            .ok_or_else(|| DomainError::UnknownSaga {
                name: name.to_string(),
            })
    }

    pub(crate) fn has_sagas(&self) -> bool {
        !self.sagas.is_empty()
    }

    /// Saga 订阅的全部事件名
    pub(crate) fn reaction_names(&self) -> BTreeSet<String> {
        self.reactions.keys().cloned().collect()
    }
}

fn duplicate(message: String, first: &str, second: &str) -> DomainError {
    DomainError::DuplicateHandler {
        message,
        first: first.to_string(),
        second: second.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_core::aggregate::AggregateDefinition;
    use chronicle_core::message::Event;

    fn pantry(name: &str) -> Definition {
        AggregateDefinition::<()>::builder(name, "1")
            .executing(
                "Foo",
                |c| c.payload.as_str().map(str::to_string),
                |_, c| Ok(vec![Event::new("food", c.payload.clone())]),
            )
            .build()
            .unwrap()
            .into()
    }

    fn feeder(name: &str) -> Definition {
        SagaDefinition::builder(name, "1")
            .reacting("food", |r| Some(r.stream_id.clone()), |_| async {
                Ok::<_, anyhow::Error>(())
            })
            .build()
            .unwrap()
            .into()
    }

    #[test]
    fn commands_route_to_exactly_one_aggregate() {
        let routes = Routes::new(vec![pantry("pantry")]).unwrap();
        assert_eq!(routes.aggregate_for("Foo").unwrap().name(), "pantry");
        assert!(matches!(
            routes.aggregate_for("Bar"),
            Err(DomainError::CannotHandle { .. })
        ));

        let err = Routes::new(vec![pantry("pantry"), pantry("larder")])
            .err()
            .unwrap();
        assert!(matches!(err, DomainError::DuplicateHandler { .. }));
    }

    #[test]
    fn events_fan_out_to_every_saga() {
        let routes = Routes::new(vec![feeder("feeder"), feeder("logger")]).unwrap();
        assert_eq!(routes.sagas_for("food").len(), 2);
        assert!(routes.sagas_for("drink").is_empty());
        assert!(routes.has_sagas());

        let err = Routes::new(vec![feeder("feeder"), feeder("feeder")])
            .err()
            .unwrap();
        assert!(matches!(err, DomainError::DuplicateDefinition { .. }));
    }
}
