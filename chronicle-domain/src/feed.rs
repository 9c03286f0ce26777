//! Saga 的后台订阅
//!
//! 订阅任务只持有 `Weak<Domain>`：领域被释放后任务自然结束。
//!
use crate::domain::Domain;
use crate::meta::vocabulary::RetryRequest;
use chronicle_core::persist::{LogEntry, LogSubscription, RecordStream};
use std::sync::Weak;
use tracing::{debug, error, warn};

/// 主日志订阅：逐条把记录交给 `Domain::react_to`
pub(crate) fn reactions(domain: Weak<Domain>, stream: RecordStream) -> LogSubscription {
    LogSubscription::spawn(stream, move |entry| {
        let domain = domain.clone();
        async move {
            let Some(domain) = domain.upgrade() else {
                return false;
            };
            match entry {
                Ok(LogEntry::Record(record)) => {
                    // 失败已经记录在元领域中，这里只保证订阅继续
                    if let Err(err) = domain.react_to(&record).await {
                        error!(domain = domain.name(), error = %err, "reaction dispatch failed");
                    }
                    true
                }
                Ok(LogEntry::CaughtUp) => {
                    debug!(domain = domain.name(), "saga feed caught up");
                    true
                }
                Ok(LogEntry::Passed { .. }) => true,
                Err(err) => {
                    error!(domain = domain.name(), error = %err, "saga feed broken");
                    false
                }
            }
        }
    })
}

/// 元日志订阅：执行重试请求
pub(crate) fn retries(domain: Weak<Domain>, stream: RecordStream) -> LogSubscription {
    LogSubscription::spawn(stream, move |entry| {
        let domain = domain.clone();
        async move {
            let Some(domain) = domain.upgrade() else {
                return false;
            };
            match entry {
                Ok(LogEntry::Record(record)) => {
                    match serde_json::from_value::<RetryRequest>(record.event.payload) {
                        Ok(request) => {
                            if let Err(err) = domain.run_retry(&request).await {
                                error!(domain = domain.name(), saga = %request.saga_key, error = %err, "reaction retry failed");
                            }
                        }
                        Err(err) => {
                            warn!(domain = domain.name(), error = %err, "malformed retry request, skipping");
                        }
                    }
                    true
                }
                Ok(LogEntry::CaughtUp | LogEntry::Passed { .. }) => true,
                Err(err) => {
                    error!(domain = domain.name(), error = %err, "retry feed broken");
                    false
                }
            }
        }
    })
}
