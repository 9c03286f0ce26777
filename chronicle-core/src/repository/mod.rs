//! 单元仓储
//!
//! 按 (定义名, ID) 缓存实例：
//! - `get_or_load` 在加载完成前就把新实例放入缓存，并发查找因此合并到同一次重建；
//! - 实例卸载时通过回收回调把自己移出缓存（只移除同一个实例）；
//! - 每次成功处理后调用可插拔的 `Strategy`，仓储本身不含任何策略。
//!
mod strategy;

pub use strategy::{KeepStrategy, LruStrategy, SnapshotStrategy, Strategy, UnitCache, UnloadStrategy};

use crate::error::UnitResult;
use crate::unit::{Unit, UnitKey, UnitKind, UnitStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub struct UnitRepository<U: ?Sized> {
    kind: UnitKind,
    units: Arc<DashMap<UnitKey, Arc<U>>>,
    strategy: Arc<dyn Strategy>,
}

impl<U: Unit + ?Sized> UnitRepository<U> {
    pub fn new(kind: UnitKind, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            kind,
            units: Arc::new(DashMap::new()),
            strategy,
        }
    }

    pub fn get(&self, key: &UnitKey) -> Option<Arc<U>> {
        self.units.get(key).map(|unit| unit.clone())
    }

    /// 返回缓存中的实例（共享进行中的加载），否则用 `factory` 创建并加载
    pub async fn get_or_load<F>(&self, key: UnitKey, factory: F) -> UnitResult<Arc<U>>
    where
        F: FnOnce() -> Arc<U>,
    {
        let unit = match self.units.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().status() != UnitStatus::Unloaded => {
                entry.get().clone()
            }
            Entry::Occupied(mut entry) => {
                let unit = factory();
                self.install_evictor(&key, &unit);
                entry.insert(unit.clone());
                unit
            }
            Entry::Vacant(entry) => {
                let unit = factory();
                self.install_evictor(&key, &unit);
                entry.insert(unit.clone());
                unit
            }
        };

        if let Err(err) = unit.load().await {
            debug!(kind = %self.kind, unit = %key, error = %err, "load failed");
            self.evict(&key, &unit);
            return Err(err);
        }
        Ok(unit)
    }

    fn install_evictor(&self, key: &UnitKey, unit: &Arc<U>) {
        let units: Weak<DashMap<UnitKey, Arc<U>>> = Arc::downgrade(&self.units);
        let key = key.clone();
        let address = address_of(unit);

        unit.on_unload(Box::new(move || {
            if let Some(units) = units.upgrade() {
                units.remove_if(&key, |_, cached| address_of(cached) == address);
            }
        }));
    }

    fn evict(&self, key: &UnitKey, unit: &Arc<U>) {
        let address = address_of(unit);
        self.units
            .remove_if(key, |_, cached| address_of(cached) == address);
    }

    /// 成功处理后调用策略钩子；策略失败只记录日志
    pub async fn accessed(&self, unit: &Arc<U>) {
        let erased = unit.clone().into_unit();
        if let Err(err) = self.strategy.on_access(erased, self).await {
            warn!(kind = %self.kind, unit = %unit.key(), error = %err, "access strategy failed");
        }
    }

    /// 卸载并移出缓存；对已卸载的实例是空操作
    pub async fn remove(&self, unit: &U) {
        if unit.status() == UnitStatus::Unloaded {
            return;
        }
        unit.unload().await;
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        self.units.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 卸载全部实例
    pub async fn clear(&self) {
        let units: Vec<Arc<U>> = self.units.iter().map(|entry| entry.value().clone()).collect();
        for unit in units {
            self.remove(&unit).await;
        }
        self.units.clear();
    }
}

fn address_of<U: ?Sized>(unit: &Arc<U>) -> usize {
    Arc::as_ptr(unit).cast::<()>() as usize
}

#[async_trait]
impl<U: Unit + ?Sized> UnitCache for UnitRepository<U> {
    fn kind(&self) -> UnitKind {
        self.kind
    }

    fn len(&self) -> usize {
        self.units.len()
    }

    fn get(&self, key: &UnitKey) -> Option<Arc<dyn Unit>> {
        UnitRepository::get(self, key).map(|unit| unit.into_unit())
    }

    async fn remove(&self, key: &UnitKey) {
        if let Some(unit) = UnitRepository::get(self, key) {
            UnitRepository::remove(self, &unit).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::UnitResult;
    use crate::message::{Query, Snapshot};
    use crate::persist::{Backend, InMemoryEventStore, SnapshotStore};
    use crate::projection::{ProjectionDefinition, ProjectionKind, ProjectionUnit};
    use crate::unit::UnitContext;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 统计快照读取次数的快照存储
    #[derive(Default)]
    struct CountingSnapshots {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotStore for CountingSnapshots {
        async fn fetch(&self, key: &str, version: &str) -> UnitResult<Snapshot> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Err(crate::error::UnitError::SnapshotNotFound {
                key: key.to_string(),
                version: version.to_string(),
            })
        }

        async fn store(&self, _key: &str, _version: &str, _snapshot: Snapshot) -> UnitResult<()> {
            Ok(())
        }
    }

    fn definition() -> ProjectionDefinition<Vec<String>> {
        ProjectionDefinition::<Vec<String>>::builder("bards", "1")
            .applying("bard", |s, r| {
                s.push(r.event.payload.to_string());
                Ok(())
            })
            .responding("Bards", |_| Some("all".into()), |s, _| Ok(json!(s)))
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lookups_share_one_load() {
        let snapshots = Arc::new(CountingSnapshots::default());
        let log = InMemoryEventStore::new();
        let backend = Backend::new(Arc::new(log.clone()), Arc::new(log.clone()), snapshots.clone());
        let context = UnitContext::new(backend, SystemClock::shared());
        let definition = definition();
        let repository: Arc<UnitRepository<dyn ProjectionUnit>> =
            Arc::new(UnitRepository::new(UnitKind::Projection, Arc::new(KeepStrategy)));

        let lookups = (0..8).map(|_| {
            let repository = repository.clone();
            let definition = definition.clone();
            let context = context.clone();
            tokio::spawn(async move {
                repository
                    .get_or_load(UnitKey::new("bards", "all"), || {
                        definition.instantiate("all", &context)
                    })
                    .await
            })
        });

        let units: Vec<_> = futures_util::future::join_all(lookups)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(units.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(snapshots.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(log.subscriber_count().await, 1);
        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn unloaded_units_leave_the_cache() {
        let context = UnitContext::new(Backend::in_memory(), SystemClock::shared());
        let definition = definition();
        let repository: UnitRepository<dyn ProjectionUnit> =
            UnitRepository::new(UnitKind::Projection, Arc::new(UnloadStrategy::default()));

        let unit = repository
            .get_or_load(UnitKey::new("bards", "all"), || definition.instantiate("all", &context))
            .await
            .unwrap();
        assert_eq!(
            unit.respond_to(&Query::new("Bards", json!(null))).await.unwrap(),
            json!([])
        );

        repository.accessed(&unit).await;
        assert!(repository.is_empty());
        assert_eq!(unit.status(), UnitStatus::Unloaded);

        // 对已卸载实例再次移除是空操作
        repository.remove(&*unit).await;

        let fresh = repository
            .get_or_load(UnitKey::new("bards", "all"), || definition.instantiate("all", &context))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&unit, &fresh));
        assert_eq!(fresh.status(), UnitStatus::Loaded);
    }
}
