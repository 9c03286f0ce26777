//! 元领域的单元定义
//!
//! - `reaction-lock` 聚合：以 saga key 为 ID，状态为当前被锁定的 `(stream_id, sequence)` 集合；
//! - `reaction-heads` 投影：推断每个 saga key 在各流上已处理完毕的位点；
//! - `last-consumed-time` 投影：最近一次加锁的记录时间，重启后从这里恢复订阅；
//! - `failed-reactions` 投影：尚未被成功重试消解的终态失败。
//!
use super::vocabulary::*;
use crate::error::DomainResult;
use chrono::{DateTime, Utc};
use chronicle_core::aggregate::AggregateDefinition;
use chronicle_core::error::Rejection;
use chronicle_core::kind::Definition;
use chronicle_core::message::{Event, Heads, Record};
use chronicle_core::projection::ProjectionDefinition;
use chronicle_core::saga::ReactionFailure;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

const SINGLETON: &str = "all";

fn decode<T: DeserializeOwned>(payload: &Value) -> anyhow::Result<T> {
    Ok(serde_json::from_value(payload.clone())?)
}

fn saga_key_of(payload: &Value) -> Option<String> {
    payload.get("saga_key")?.as_str().map(str::to_string)
}

fn own_stream(record: &Record) -> Option<String> {
    Some(record.stream_id.clone())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ReactionLocks {
    locked: BTreeSet<(String, u64)>,
}

fn lock_aggregate() -> DomainResult<Definition> {
    let definition = AggregateDefinition::<ReactionLocks>::builder("reaction-lock", VERSION)
        .executing(
            LOCK_REACTION,
            |c| saga_key_of(&c.payload),
            |s, c| {
                let lock: ReactionLock = decode(&c.payload)?;
                if s.locked.contains(&(lock.stream_id.clone(), lock.sequence)) {
                    return Err(Rejection::new(format!(
                        "reaction already locked: {}#{}",
                        lock.stream_id, lock.sequence
                    ))
                    .into());
                }
                Ok(vec![Event::new(REACTION_LOCKED, serde_json::to_value(&lock)?)])
            },
        )
        .executing(
            UNLOCK_REACTION,
            |c| saga_key_of(&c.payload),
            |s, c| {
                let unlock: ReactionUnlock = decode(&c.payload)?;
                if !s.locked.contains(&(unlock.stream_id.clone(), unlock.sequence)) {
                    return Ok(vec![]);
                }
                Ok(vec![Event::new(REACTION_UNLOCKED, serde_json::to_value(&unlock)?)])
            },
        )
        .executing(
            FAIL_REACTION,
            |c| saga_key_of(&c.payload),
            |_, c| {
                let failure: ReactionFailure = decode(&c.payload)?;
                Ok(vec![Event::new(REACTION_FAILED, serde_json::to_value(&failure)?)])
            },
        )
        .executing(
            REQUEST_REACTION_RETRY,
            |c| saga_key_of(&c.payload),
            |_, c| {
                let request: RetryRequest = decode(&c.payload)?;
                Ok(vec![Event::new(
                    REACTION_RETRY_REQUESTED,
                    serde_json::to_value(&request)?,
                )])
            },
        )
        .applying(REACTION_LOCKED, |s, r| {
            let lock: ReactionLock = decode(&r.event.payload)?;
            s.locked.insert((lock.stream_id, lock.sequence));
            Ok(())
        })
        .applying(REACTION_UNLOCKED, |s, r| {
            let unlock: ReactionUnlock = decode(&r.event.payload)?;
            s.locked.remove(&(unlock.stream_id, unlock.sequence));
            Ok(())
        })
        .build()?;

    Ok(definition.into())
}

/// 单条源流上的处理进度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct StreamProgress {
    head: u64,
    pending: BTreeSet<u64>,
    resolved: BTreeSet<u64>,
}

impl StreamProgress {
    /// 已处理完毕的序号再次加锁（重复投递）不再计为未决
    fn lock(&mut self, sequence: u64) {
        if sequence > self.head && !self.resolved.contains(&sequence) {
            self.pending.insert(sequence);
        }
    }

    /// 成功解锁或终态失败才算处理完毕；失败的单次尝试仍保持未决
    fn release(&mut self, sequence: u64, resolved: bool) {
        if !resolved {
            return;
        }
        self.pending.remove(&sequence);
        if sequence > self.head {
            self.resolved.insert(sequence);
        }
        self.settle();
    }

    /// head 推进到“之前没有未决锁”的最大已处理序号
    fn settle(&mut self) {
        let floor = self.pending.first().copied();
        let settled: Vec<u64> = self
            .resolved
            .iter()
            .copied()
            .take_while(|sequence| floor.is_none_or(|floor| *sequence < floor))
            .collect();

        if let Some(last) = settled.last() {
            self.head = self.head.max(*last);
        }
        for sequence in settled {
            self.resolved.remove(&sequence);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ReactionHeads {
    streams: BTreeMap<String, StreamProgress>,
}

impl ReactionHeads {
    fn stream(&mut self, stream_id: &str) -> &mut StreamProgress {
        self.streams.entry(stream_id.to_string()).or_default()
    }

    pub(crate) fn heads(&self) -> Heads {
        self.streams
            .iter()
            .filter(|(_, progress)| progress.head > 0)
            .map(|(stream_id, progress)| (stream_id.as_str(), progress.head))
            .collect()
    }
}

fn reaction_heads() -> DomainResult<Definition> {
    let definition = ProjectionDefinition::<ReactionHeads>::builder(REACTION_HEADS, VERSION)
        .applying_for(REACTION_LOCKED, own_stream, |s, r| {
            let lock: ReactionLock = decode(&r.event.payload)?;
            s.stream(&lock.stream_id).lock(lock.sequence);
            Ok(())
        })
        .applying_for(REACTION_UNLOCKED, own_stream, |s, r| {
            let unlock: ReactionUnlock = decode(&r.event.payload)?;
            s.stream(&unlock.stream_id)
                .release(unlock.sequence, unlock.completed);
            Ok(())
        })
        .applying_for(REACTION_FAILED, own_stream, |s, r| {
            let failure: ReactionFailure = decode(&r.event.payload)?;
            s.stream(&failure.record.stream_id)
                .release(failure.record.sequence, true);
            Ok(())
        })
        .responding(
            REACTION_HEADS,
            |q| saga_key_of(&q.payload),
            |s, _| Ok(serde_json::to_value(s.heads())?),
        )
        .build()?;

    Ok(definition.into())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LastConsumed {
    time: Option<DateTime<Utc>>,
}

fn last_consumed_time() -> DomainResult<Definition> {
    let definition = ProjectionDefinition::<LastConsumed>::builder(LAST_CONSUMED_TIME, VERSION)
        .applying(REACTION_LOCKED, |s, r| {
            let lock: ReactionLock = decode(&r.event.payload)?;
            if s.time.is_none_or(|time| time < lock.record_time) {
                s.time = Some(lock.record_time);
            }
            Ok(())
        })
        .responding(
            LAST_CONSUMED_TIME,
            |_| Some(SINGLETON.to_string()),
            |s, _| Ok(json!(s.time)),
        )
        .build()?;

    Ok(definition.into())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct FailedReactions {
    failures: Vec<ReactionFailure>,
}

impl FailedReactions {
    fn remove(&mut self, saga_key: &str, stream_id: &str, sequence: u64) {
        self.failures.retain(|f| {
            !(f.saga_key == saga_key
                && f.record.stream_id == stream_id
                && f.record.sequence == sequence)
        });
    }
}

fn failed_reactions() -> DomainResult<Definition> {
    let definition = ProjectionDefinition::<FailedReactions>::builder(FAILED_REACTIONS, VERSION)
        .applying(REACTION_FAILED, |s, r| {
            let failure: ReactionFailure = decode(&r.event.payload)?;
            s.remove(
                &failure.saga_key,
                &failure.record.stream_id,
                failure.record.sequence,
            );
            s.failures.push(failure);
            Ok(())
        })
        .applying(REACTION_UNLOCKED, |s, r| {
            let unlock: ReactionUnlock = decode(&r.event.payload)?;
            if unlock.completed {
                s.remove(&unlock.saga_key, &unlock.stream_id, unlock.sequence);
            }
            Ok(())
        })
        .responding(
            FAILED_REACTIONS,
            |_| Some(SINGLETON.to_string()),
            |s, _| Ok(serde_json::to_value(&s.failures)?),
        )
        .build()?;

    Ok(definition.into())
}

/// 元领域注册的全部定义
pub(crate) fn definitions() -> DomainResult<Vec<Definition>> {
    Ok(vec![
        lock_aggregate()?,
        reaction_heads()?,
        last_consumed_time()?,
        failed_reactions()?,
    ])
}
