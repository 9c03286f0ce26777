//! 单元（Unit）：可重建的事件溯源实体
//!
//! 聚合、投影与 Saga 共享同一套生命周期：
//! `Constructed → Loading → Loaded → Unloaded`。
//! 实例按需从快照 + 事件日志重建，应用器按流位点去重，
//! 应用器失败时实例自卸载，下次访问重新构建（crash-only）。
//!
mod definition;
mod instance;
mod version;

pub use definition::{
    Applier, ApplyFn, Consolidator, Initializer, RecordMapper, UnitDefinition,
    UnitDefinitionBuilder,
};
pub use instance::UnitInstance;
pub use version::SnapshotVersion;

use crate::clock::Clock;
use crate::error::UnitResult;
use crate::message::Heads;
use crate::persist::Backend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 单元状态需要满足的能力边界（可快照、可在任务间共享）
pub trait UnitState: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> UnitState for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// 单元种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Aggregate,
    Projection,
    Saga,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Aggregate => f.write_str("aggregate"),
            UnitKind::Projection => f.write_str("projection"),
            UnitKind::Saga => f.write_str("saga"),
        }
    }
}

/// 实例标识：(定义名, 单元 ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub definition: String,
    pub id: String,
}

impl UnitKey {
    pub fn new(definition: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            definition: definition.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.definition, self.id)
    }
}

/// 生命周期状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnitStatus {
    #[default]
    Constructed,
    Loading,
    Loaded,
    Unloaded,
}

/// 实例对外可观察的进度：各流 head、最后记录时间与生命周期状态
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub heads: Heads,
    pub last_record_time: Option<DateTime<Utc>>,
    pub status: UnitStatus,
    /// 订阅已交付完全部已持久化记录
    pub caught_up: bool,
    /// 自卸载原因（应用器或日志失败）
    pub failure: Option<String>,
}

/// 带 `heads` 的查询默认最多等待的时长
pub const DEFAULT_CAUSAL_TIMEOUT: Duration = Duration::from_secs(30);

/// 实例重建与写入所依赖的协作方
#[derive(Clone)]
pub struct UnitContext {
    pub backend: Backend,
    pub clock: Arc<dyn Clock>,
    /// `wait_for_heads` 的上限，超时返回 `UnitError::CausalTimeout`
    pub causal_timeout: Duration,
}

impl UnitContext {
    pub fn new(backend: Backend, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            causal_timeout: DEFAULT_CAUSAL_TIMEOUT,
        }
    }

    pub fn with_causal_timeout(mut self, timeout: Duration) -> Self {
        self.causal_timeout = timeout;
        self
    }
}

/// 仓储在创建实例后注入的回收回调，实例卸载时调用以从缓存中移除自身
pub type Evictor = Box<dyn Fn() + Send + Sync>;

/// 类型擦除后的单元生命周期
#[async_trait]
pub trait Unit: Send + Sync + 'static {
    fn key(&self) -> &UnitKey;

    fn kind(&self) -> UnitKind;

    fn status(&self) -> UnitStatus;

    fn heads(&self) -> Heads;

    /// 幂等且可重入：加载中的重复调用共享同一次加载
    async fn load(&self) -> UnitResult<()>;

    /// 以 (key, version) 持久化 `{heads, state}`
    async fn take_snapshot(&self) -> UnitResult<()>;

    /// 取消日志订阅并从仓储移除；具体种类可推迟执行
    async fn unload(&self);

    fn on_unload(&self, evictor: Evictor);

    fn into_unit(self: Arc<Self>) -> Arc<dyn Unit>;
}
