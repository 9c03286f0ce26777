//! 领域运行时
//!
//! `Domain` 是对外的唯一入口：注册单元定义，执行命令、应答与订阅查询、
//! 把日志记录交给 Saga。Saga 的加锁与进度由内嵌的元领域（`meta`）负责协调。
//!
pub mod config;
pub mod domain;
pub mod error;
mod feed;
pub mod meta;
mod routing;

pub use config::DomainConfig;
pub use domain::Domain;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use meta::MetaDomain;

pub use chronicle_core;
