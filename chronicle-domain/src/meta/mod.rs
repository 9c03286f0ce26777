//! 元领域（meta domain）
//!
//! 每个注册了 Saga 的领域都拥有一个独立后端上的内嵌领域，专门保存反应协调记录：
//! 加锁聚合、已处理位点、最近消费时间与终态失败。`MetaDomain` 以
//! `ReactionCoordinator` 的形式交给 Saga 实例使用。
//!
mod definitions;
pub mod vocabulary;

use self::vocabulary::*;
use crate::config::DomainConfig;
use crate::domain::Domain;
use crate::error::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronicle_core::clock::Clock;
use chronicle_core::error::{UnitError, UnitResult};
use chronicle_core::message::{Command, Heads, Query, Record};
use chronicle_core::persist::Backend;
use chronicle_core::saga::{ReactionCoordinator, ReactionFailure};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct MetaDomain {
    domain: Domain,
}

impl MetaDomain {
    pub(crate) fn new(
        owner: &str,
        backend: Backend,
        clock: Arc<dyn Clock>,
        config: DomainConfig,
    ) -> DomainResult<Self> {
        let domain = Domain::builder()
            .name(format!("{owner}.meta"))
            .backend(backend)
            .definitions(definitions::definitions()?)
            .clock(clock)
            .config(config)
            .build()?;

        Ok(Self { domain })
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn backend(&self) -> &Backend {
        &self.domain.context().backend
    }

    async fn send(&self, name: &str, payload: &impl Serialize, trace_id: &str) -> DomainResult<()> {
        let payload = serde_json::to_value(payload).map_err(UnitError::from)?;
        let command = Command::new(name, payload).with_trace_id(trace_id);
        self.domain.execute(command).await?;
        Ok(())
    }

    async fn ask<T: DeserializeOwned>(&self, name: &str, payload: Value) -> DomainResult<T> {
        let value = self.domain.respond_to(Query::new(name, payload)).await?;
        serde_json::from_value(value).map_err(|err| DomainError::Meta {
            reason: format!("unexpected {name} response: {err}"),
        })
    }

    /// 最近一次加锁的记录时间；从未加锁时为 `None`
    pub async fn last_consumed_time(&self) -> DomainResult<Option<DateTime<Utc>>> {
        self.ask(LAST_CONSUMED_TIME, Value::Null).await
    }

    /// 尚未被成功重试消解的终态失败
    pub async fn failed_reactions(&self) -> DomainResult<Vec<ReactionFailure>> {
        self.ask(FAILED_REACTIONS, Value::Null).await
    }

    /// 发布一条 `reaction-retry-requested`
    pub async fn request_retry(&self, request: RetryRequest) -> DomainResult<()> {
        let trace_id = request.record.trace_id.clone();
        self.send(REQUEST_REACTION_RETRY, &request, &trace_id).await
    }
}

#[async_trait]
impl ReactionCoordinator for MetaDomain {
    async fn lock(&self, saga_key: &str, record: &Record) -> UnitResult<()> {
        let lock = ReactionLock::new(saga_key, record);
        Ok(self.send(LOCK_REACTION, &lock, &record.trace_id).await?)
    }

    async fn unlock(&self, saga_key: &str, record: &Record, completed: bool) -> UnitResult<()> {
        let unlock = ReactionUnlock {
            saga_key: saga_key.to_string(),
            stream_id: record.stream_id.clone(),
            sequence: record.sequence,
            completed,
        };
        Ok(self.send(UNLOCK_REACTION, &unlock, &record.trace_id).await?)
    }

    async fn fail(&self, failure: ReactionFailure) -> UnitResult<()> {
        let trace_id = failure.record.trace_id.clone();
        Ok(self.send(FAIL_REACTION, &failure, &trace_id).await?)
    }

    async fn heads(&self, saga_key: &str) -> UnitResult<Heads> {
        Ok(self
            .ask(REACTION_HEADS, json!({ "saga_key": saga_key }))
            .await?)
    }
}
