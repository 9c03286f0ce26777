//! 事件溯源 / CQRS 单元运行时（chronicle-core）
//!
//! 提供可重建的事件溯源单元及其运行所需的全部构件：
//! - 消息模型（`message`）：事件、记录、命令、查询、快照与按流位点 `Heads`
//! - 协作方契约（`persist`）：事件存储、事件日志、快照存储，以及内存实现
//! - 单元生命周期（`unit`）：快照 + 日志重建、按位点去重、应用器失败自卸载
//! - 三种单元：聚合（`aggregate`）、投影（`projection`）、Saga（`saga`）
//! - 定义的封闭和类型（`kind`）与带可插拔策略的仓储（`repository`）
//! - 重试策略（`retry`）与可注入时钟（`clock`）
//!
//! 本 crate 不关心具体存储与传输实现，持久化后端由上层注入。
//!
//! 典型用法：
//! 1. 用 `AggregateDefinition` / `ProjectionDefinition` / `SagaDefinition` 的构建器
//!    声明执行器、应用器、应答器与反应器；
//! 2. 选择 `persist` 中的后端（或内存实现）组装 `Backend`；
//! 3. 交给上层的领域路由（chronicle-domain）按消息名分发。
//!
pub mod aggregate;
pub mod clock;
pub mod error;
pub mod kind;
pub mod message;
pub mod persist;
pub mod projection;
pub mod repository;
pub mod retry;
pub mod saga;
pub mod unit;
