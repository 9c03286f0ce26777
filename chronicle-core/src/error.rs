//! 运行时统一错误定义
//!
//! 按失败语义分类：映射/路由失败、领域拒绝（Rejection）、存储冲突、
//! 应用器失败（实例自卸载）以及协作方（存储/日志/快照）错误，
//! 便于上层在适配器中区分“预期拒绝”与“内部错误”。
//!
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 领域声明的、预期内的拒绝（如业务规则不满足）。
///
/// 用户回调（executer/responder/reactor）通过返回该错误表达拒绝：
///
/// ```
/// use chronicle_core::error::Rejection;
///
/// fn withdraw(balance: i64, amount: i64) -> anyhow::Result<()> {
///     if amount > balance {
///         return Err(Rejection::new("insufficient funds").into());
///     }
///     Ok(())
/// }
///
/// assert!(withdraw(1, 2).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}")]
pub struct Rejection {
    reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum UnitError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 映射/定义 ---
    #[error("Cannot map [{message}]")]
    CannotMap { message: String },
    #[error("cannot handle [{message}] in unit {unit}")]
    CannotHandle { unit: String, message: String },
    #[error("duplicate registration: definition={definition}, name={name}")]
    DuplicateRegistration { definition: String, name: String },
    #[error("invalid definition: {reason}")]
    InvalidDefinition { reason: String },

    // --- 领域规则 ---
    #[error("rejected: {0}")]
    Rejected(Rejection),

    // --- 协作方 ---
    #[error("out of sequence: stream={stream_id}, expected={expected}, actual={actual}")]
    OutOfSequence {
        stream_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("snapshot not found: key={key}, version={version}")]
    SnapshotNotFound { key: String, version: String },
    #[error("event store error: {reason}")]
    EventStore { reason: String },
    #[error("event log error: {reason}")]
    EventLog { reason: String },
    #[error("snapshot store error: {reason}")]
    SnapshotStore { reason: String },
    #[error("reaction coordination error: {reason}")]
    Coordination { reason: String },

    // --- 单元生命周期 ---
    #[error("applier failed: unit={unit}, event={event}, reason={reason}")]
    Applier {
        unit: String,
        event: String,
        reason: String,
    },
    #[error("handler failed: unit={unit}, message={message}: {source:#}")]
    Handler {
        unit: String,
        message: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("timed out waiting for heads: unit={unit}, heads={heads}")]
    CausalTimeout { unit: String, heads: String },
    #[error("unit unloaded: {unit}")]
    Unloaded { unit: String },
    #[error("unit poisoned: unit={unit}, reason={reason}")]
    Poisoned { unit: String, reason: String },
}

/// 统一 Result 类型别名
pub type UnitResult<T> = Result<T, UnitError>;

impl UnitError {
    /// 将用户回调返回的错误归类：拒绝保持原样，运行时错误透传，其余视为处理器失败
    pub fn from_handler(unit: &str, message: &str, err: anyhow::Error) -> Self {
        if let Some(rejection) = err.downcast_ref::<Rejection>() {
            return UnitError::Rejected(rejection.clone());
        }

        match err.downcast::<UnitError>() {
            Ok(inner) => inner,
            Err(err) => UnitError::Handler {
                unit: unit.to_string(),
                message: message.to_string(),
                source: err,
            },
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, UnitError::Rejected(_))
    }

    pub fn is_out_of_sequence(&self) -> bool {
        matches!(self, UnitError::OutOfSequence { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UnitError::SnapshotNotFound { .. })
    }

    /// 映射失败与路由失败：调用方可据此返回 4xx 类响应
    pub fn is_mapping(&self) -> bool {
        matches!(
            self,
            UnitError::CannotMap { .. } | UnitError::CannotHandle { .. }
        )
    }
}

impl From<Rejection> for UnitError {
    fn from(rejection: Rejection) -> Self {
        UnitError::Rejected(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_errors_are_classified() {
        let err = UnitError::from_handler("acc/1", "Withdraw", Rejection::new("nope").into());
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "rejected: nope");

        let err = UnitError::from_handler(
            "acc/1",
            "Withdraw",
            UnitError::CannotMap {
                message: "Withdraw".into(),
            }
            .into(),
        );
        assert!(err.is_mapping());

        let err = UnitError::from_handler("acc/1", "Withdraw", anyhow::anyhow!("boom"));
        match err {
            UnitError::Handler { unit, message, .. } => {
                assert_eq!(unit, "acc/1");
                assert_eq!(message, "Withdraw");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
