//! 单元定义
//!
//! 一个单元“类”的声明式描述：初始化器（种子状态）、应用器（事件名 → 有序的
//! {流映射, 应用函数} 列表）、快照版本。构建器在 `build()` 时校验，定义构建后不可变。
//!
use crate::error::{UnitError, UnitResult};
use crate::message::{Heads, Record};
use crate::unit::{SnapshotVersion, UnitState};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// 种子状态函数：`(state, unit_id)`
pub type Initializer<S> = Arc<dyn Fn(&mut S, &str) + Send + Sync>;

/// 应用函数：将一条记录投影到状态；返回错误会使实例自卸载
pub type ApplyFn<S> = Arc<dyn Fn(&mut S, &Record) -> anyhow::Result<()> + Send + Sync>;

/// 记录 → 单元 ID 的映射；返回 `None` 表示与任何实例无关
pub type RecordMapper = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// 追平日志后的整理钩子
pub type Consolidator<S> = Arc<dyn Fn(&mut S, &Heads) + Send + Sync>;

/// 一个已注册的应用器
pub struct Applier<S> {
    mapper: Option<RecordMapper>,
    apply: ApplyFn<S>,
}

impl<S> Clone for Applier<S> {
    fn clone(&self) -> Self {
        Self {
            mapper: self.mapper.clone(),
            apply: self.apply.clone(),
        }
    }
}

impl<S> Applier<S> {
    /// 未设置映射时对所有收到该记录的实例生效
    pub fn applies_to(&self, unit_id: &str, record: &Record) -> bool {
        match &self.mapper {
            None => true,
            Some(mapper) => mapper(record).as_deref() == Some(unit_id),
        }
    }

    pub fn apply(&self, state: &mut S, record: &Record) -> anyhow::Result<()> {
        (self.apply)(state, record)
    }
}

/// 单元定义
pub struct UnitDefinition<S> {
    name: String,
    version: SnapshotVersion,
    initializers: Vec<Initializer<S>>,
    appliers: HashMap<String, Vec<Applier<S>>>,
    consolidators: Vec<Consolidator<S>>,
}

impl<S: UnitState> UnitDefinition<S> {
    pub fn builder(
        name: impl Into<String>,
        version: impl Into<SnapshotVersion>,
    ) -> UnitDefinitionBuilder<S> {
        UnitDefinitionBuilder {
            name: name.into(),
            version: version.into(),
            initializers: Vec::new(),
            appliers: HashMap::new(),
            consolidators: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &SnapshotVersion {
        &self.version
    }

    /// 已注册应用器的事件名集合，用作日志订阅过滤条件
    pub fn event_names(&self) -> BTreeSet<String> {
        self.appliers.keys().cloned().collect()
    }

    pub fn appliers(&self, event_name: &str) -> &[Applier<S>] {
        self.appliers
            .get(event_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// 运行全部初始化器，得到种子状态
    pub fn seed(&self, unit_id: &str) -> S {
        let mut state = S::default();
        for initialize in &self.initializers {
            initialize(&mut state, unit_id);
        }
        state
    }

    pub fn consolidate(&self, state: &mut S, heads: &Heads) {
        for consolidate in &self.consolidators {
            consolidate(state, heads);
        }
    }
}

/// `UnitDefinition` 的构建器
pub struct UnitDefinitionBuilder<S> {
    name: String,
    version: SnapshotVersion,
    initializers: Vec<Initializer<S>>,
    appliers: HashMap<String, Vec<Applier<S>>>,
    consolidators: Vec<Consolidator<S>>,
}

impl<S: UnitState> UnitDefinitionBuilder<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 追加一个初始化器（按注册顺序执行）
    pub fn initializing<F>(mut self, initialize: F) -> Self
    where
        F: Fn(&mut S, &str) + Send + Sync + 'static,
    {
        self.initializers.push(Arc::new(initialize));
        self
    }

    /// 对收到的每条 `event` 记录执行 `apply`
    pub fn applying<F>(self, event: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut S, &Record) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_applier(event.into(), None, Arc::new(apply))
    }

    /// 仅当 `mapper(record)` 等于实例 ID 时执行 `apply`
    pub fn applying_for<M, F>(self, event: impl Into<String>, mapper: M, apply: F) -> Self
    where
        M: Fn(&Record) -> Option<String> + Send + Sync + 'static,
        F: Fn(&mut S, &Record) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_applier(event.into(), Some(Arc::new(mapper)), Arc::new(apply))
    }

    /// 追平日志后执行的整理钩子
    pub fn consolidating<F>(mut self, consolidate: F) -> Self
    where
        F: Fn(&mut S, &Heads) + Send + Sync + 'static,
    {
        self.consolidators.push(Arc::new(consolidate));
        self
    }

    fn push_applier(
        mut self,
        event: String,
        mapper: Option<RecordMapper>,
        apply: ApplyFn<S>,
    ) -> Self {
        self.appliers
            .entry(event)
            .or_default()
            .push(Applier { mapper, apply });
        self
    }

    pub fn build(self) -> UnitResult<UnitDefinition<S>> {
        if self.name.trim().is_empty() {
            return Err(UnitError::InvalidDefinition {
                reason: "definition name must not be empty".into(),
            });
        }
        if self.version.as_str().trim().is_empty() {
            return Err(UnitError::InvalidDefinition {
                reason: format!("definition {} requires a snapshot version", self.name),
            });
        }

        Ok(UnitDefinition {
            name: self.name,
            version: self.version,
            initializers: self.initializers,
            appliers: self.appliers,
            consolidators: self.consolidators,
        })
    }
}
