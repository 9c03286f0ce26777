use crate::error::UnitResult as Result;
use crate::message::Snapshot;
use async_trait::async_trait;
use std::sync::Arc;

/// 快照存储协议
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// 读取快照；不存在时返回 `UnitError::SnapshotNotFound`
    async fn fetch(&self, key: &str, version: &str) -> Result<Snapshot>;

    async fn store(&self, key: &str, version: &str, snapshot: Snapshot) -> Result<()>;
}

#[async_trait]
impl<T> SnapshotStore for Arc<T>
where
    T: SnapshotStore + ?Sized,
{
    async fn fetch(&self, key: &str, version: &str) -> Result<Snapshot> {
        (**self).fetch(key, version).await
    }

    async fn store(&self, key: &str, version: &str, snapshot: Snapshot) -> Result<()> {
        (**self).store(key, version, snapshot).await
    }
}
