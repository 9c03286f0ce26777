//! 访问策略
//!
//! 仓储在每次成功处理（命令执行、查询应答、记录反应）后调用 `Strategy::on_access`，
//! 由策略决定是否快照、卸载或淘汰其他实例。
//!
use crate::error::UnitResult;
use crate::unit::{Unit, UnitKey, UnitKind};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 策略看到的仓储视图
#[async_trait]
pub trait UnitCache: Send + Sync {
    fn kind(&self) -> UnitKind;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &UnitKey) -> Option<Arc<dyn Unit>>;

    /// 卸载并移出缓存
    async fn remove(&self, key: &UnitKey);
}

#[async_trait]
pub trait Strategy: Send + Sync {
    async fn on_access(&self, unit: Arc<dyn Unit>, cache: &dyn UnitCache) -> UnitResult<()>;
}

/// 什么都不做：实例常驻缓存
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepStrategy;

#[async_trait]
impl Strategy for KeepStrategy {
    async fn on_access(&self, _unit: Arc<dyn Unit>, _cache: &dyn UnitCache) -> UnitResult<()> {
        Ok(())
    }
}

/// 每 N 次访问对该实例做一次快照
#[derive(Debug, Default)]
pub struct SnapshotStrategy {
    interval: u64,
    accesses: DashMap<UnitKey, u64>,
}

impl SnapshotStrategy {
    pub fn every_access() -> Self {
        Self::every(1)
    }

    pub fn every(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            accesses: DashMap::new(),
        }
    }

    fn should_snapshot(&self, key: &UnitKey) -> bool {
        let mut count = self.accesses.entry(key.clone()).or_insert(0);
        *count += 1;
        count.is_multiple_of(self.interval.max(1))
    }
}

#[async_trait]
impl Strategy for SnapshotStrategy {
    async fn on_access(&self, unit: Arc<dyn Unit>, _cache: &dyn UnitCache) -> UnitResult<()> {
        if self.should_snapshot(unit.key()) {
            unit.take_snapshot().await?;
        }
        Ok(())
    }
}

/// 每次访问后卸载实例，可选地先做快照
#[derive(Debug, Clone, Copy, Default)]
pub struct UnloadStrategy {
    snapshot_first: bool,
}

impl UnloadStrategy {
    pub fn with_snapshot() -> Self {
        Self {
            snapshot_first: true,
        }
    }
}

#[async_trait]
impl Strategy for UnloadStrategy {
    async fn on_access(&self, unit: Arc<dyn Unit>, cache: &dyn UnitCache) -> UnitResult<()> {
        if self.snapshot_first {
            unit.take_snapshot().await?;
        }
        cache.remove(unit.key()).await;
        Ok(())
    }
}

/// 最近最少使用淘汰：缓存超过容量时，快照并卸载最久未访问的实例
#[derive(Debug)]
pub struct LruStrategy {
    capacity: usize,
    recent: Mutex<VecDeque<UnitKey>>,
}

impl LruStrategy {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl Strategy for LruStrategy {
    async fn on_access(&self, unit: Arc<dyn Unit>, cache: &dyn UnitCache) -> UnitResult<()> {
        let evicted: Vec<UnitKey> = {
            let mut recent = self.recent.lock().await;
            recent.retain(|key| key != unit.key() && cache.get(key).is_some());
            recent.push_back(unit.key().clone());

            let excess = recent.len().saturating_sub(self.capacity);
            recent.drain(..excess).collect()
        };

        for key in evicted {
            let Some(victim) = cache.get(&key) else {
                continue;
            };
            debug!(kind = %cache.kind(), unit = %key, "evicting least recently used");
            if let Err(err) = victim.take_snapshot().await {
                warn!(unit = %key, error = %err, "snapshot before eviction failed");
            }
            cache.remove(&key).await;
        }
        Ok(())
    }
}
