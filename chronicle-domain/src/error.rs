//! 领域层错误
//!
//! 在单元错误之上补充路由相关的失败，并给适配器一个粗粒度的分类：
//! 拒绝与映射/路由失败可以翻译成 4xx 类响应，其余均为内部错误。
//!
use chronicle_core::error::{Rejection, UnitError};
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error("cannot handle [{message}]")]
    CannotHandle { message: String },

    #[error("handler already registered: message={message}, first={first}, second={second}")]
    DuplicateHandler {
        message: String,
        first: String,
        second: String,
    },

    #[error("definition already registered: {name}")]
    DuplicateDefinition { name: String },

    #[error("unknown saga: {name}")]
    UnknownSaga { name: String },

    #[error("meta domain: {reason}")]
    Meta { reason: String },
}

/// 领域层统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

/// 面向适配器的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 领域声明的拒绝
    Rejection,
    /// 消息无法映射到单元 ID
    Mapping,
    /// 没有或有多个处理者
    Routing,
    /// 其余一切非预期错误
    Internal,
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Unit(UnitError::Rejected(_)) => ErrorKind::Rejection,
            DomainError::Unit(UnitError::CannotMap { .. }) => ErrorKind::Mapping,
            DomainError::Unit(UnitError::CannotHandle { .. })
            | DomainError::Unit(UnitError::DuplicateRegistration { .. })
            | DomainError::CannotHandle { .. }
            | DomainError::DuplicateHandler { .. }
            | DomainError::DuplicateDefinition { .. }
            | DomainError::UnknownSaga { .. } => ErrorKind::Routing,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.kind() == ErrorKind::Rejection
    }

    /// 拒绝原因（仅当错误为领域拒绝时）
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            DomainError::Unit(UnitError::Rejected(rejection)) => Some(rejection),
            _ => None,
        }
    }
}

impl From<Rejection> for DomainError {
    fn from(rejection: Rejection) -> Self {
        DomainError::Unit(UnitError::Rejected(rejection))
    }
}

impl From<DomainError> for UnitError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Unit(inner) => inner,
            other => UnitError::Coordination {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified_for_adapters() {
        let rejected: DomainError = Rejection::new("insufficient funds").into();
        assert_eq!(rejected.kind(), ErrorKind::Rejection);
        assert_eq!(rejected.rejection().map(Rejection::reason), Some("insufficient funds"));

        let unmapped = DomainError::from(UnitError::CannotMap {
            message: "Deposit".into(),
        });
        assert_eq!(unmapped.kind(), ErrorKind::Mapping);

        let unrouted = DomainError::CannotHandle {
            message: "Nope".into(),
        };
        assert_eq!(unrouted.kind(), ErrorKind::Routing);

        let conflict = DomainError::from(UnitError::OutOfSequence {
            stream_id: "acc-1".into(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(conflict.kind(), ErrorKind::Internal);
    }
}
