//! 定义的封闭和类型
//!
//! 三种单元定义各自携带处理器表；`can_handle` 与 `map_to_id`
//! 按变体匹配分发，而不是依赖继承来的动态方法。
//!
use crate::aggregate::{AggregateDefinition, AggregateKind};
use crate::error::{UnitError, UnitResult};
use crate::message::Message;
use crate::projection::{ProjectionDefinition, ProjectionKind};
use crate::saga::SagaDefinition;
use crate::unit::{SnapshotVersion, UnitKind, UnitState};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// 注册到领域中的一个单元定义
#[derive(Clone)]
pub enum Definition {
    Aggregate(Arc<dyn AggregateKind>),
    Projection(Arc<dyn ProjectionKind>),
    Saga(Arc<SagaDefinition>),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::Aggregate(definition) => definition.name(),
            Definition::Projection(definition) => definition.name(),
            Definition::Saga(definition) => definition.name(),
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Definition::Aggregate(_) => UnitKind::Aggregate,
            Definition::Projection(_) => UnitKind::Projection,
            Definition::Saga(_) => UnitKind::Saga,
        }
    }

    pub fn version(&self) -> &SnapshotVersion {
        match self {
            Definition::Aggregate(definition) => definition.version(),
            Definition::Projection(definition) => definition.version(),
            Definition::Saga(definition) => definition.version(),
        }
    }

    /// 该定义处理的消息名：命令名、查询名或事件名
    pub fn message_names(&self) -> BTreeSet<String> {
        match self {
            Definition::Aggregate(definition) => definition.command_names(),
            Definition::Projection(definition) => definition.query_names(),
            Definition::Saga(definition) => definition.event_names(),
        }
    }

    pub fn can_handle(&self, message: Message<'_>) -> bool {
        match (self, message) {
            (Definition::Aggregate(definition), Message::Command(command)) => {
                definition.can_execute(&command.name)
            }
            (Definition::Projection(definition), Message::Query(query)) => {
                definition.can_respond(&query.name)
            }
            (Definition::Saga(definition), Message::Record(record)) => {
                definition.can_react(record.name())
            }
            _ => false,
        }
    }

    /// 将消息映射到单元 ID；消息类型与定义种类不符时视为无法处理
    pub fn map_to_id(&self, message: Message<'_>) -> UnitResult<String> {
        match (self, message) {
            (Definition::Aggregate(definition), Message::Command(command)) => {
                definition.map_to_id(command)
            }
            (Definition::Projection(definition), Message::Query(query)) => {
                definition.map_to_id(query)
            }
            (Definition::Saga(definition), Message::Record(record)) => {
                definition.map_to_id(record)
            }
            (definition, message) => Err(UnitError::CannotHandle {
                unit: definition.name().to_string(),
                message: message.name().to_string(),
            }),
        }
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("version", self.version())
            .finish()
    }
}

impl<S: UnitState> From<AggregateDefinition<S>> for Definition {
    fn from(definition: AggregateDefinition<S>) -> Self {
        Definition::Aggregate(Arc::new(definition))
    }
}

impl<S: UnitState> From<ProjectionDefinition<S>> for Definition {
    fn from(definition: ProjectionDefinition<S>) -> Self {
        Definition::Projection(Arc::new(definition))
    }
}

impl From<SagaDefinition> for Definition {
    fn from(definition: SagaDefinition) -> Self {
        Definition::Saga(Arc::new(definition))
    }
}
