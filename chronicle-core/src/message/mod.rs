//! 消息模型（message）
//!
//! 不可变的纯数据类型：事件（`Event`）、日志记录（`Record`）、命令（`Command`）、
//! 查询（`Query`）、快照（`Snapshot`）以及按流记录位点的 `Heads`。
//! 不包含任何行为，线格式由上层适配器自行决定。

mod command;
mod event;
mod heads;
mod query;
mod record;
mod snapshot;

pub use command::Command;
pub use event::Event;
pub use heads::Heads;
pub use query::Query;
pub use record::Record;
pub use snapshot::Snapshot;

/// 进入路由的消息（命令、查询或已持久化的日志记录）
#[derive(Debug, Clone, Copy)]
pub enum Message<'a> {
    Command(&'a Command),
    Query(&'a Query),
    Record(&'a Record),
}

impl Message<'_> {
    /// 消息名：命令名、查询名或事件名
    pub fn name(&self) -> &str {
        match self {
            Message::Command(command) => &command.name,
            Message::Query(query) => &query.name,
            Message::Record(record) => &record.event.name,
        }
    }

    pub fn trace_id(&self) -> &str {
        match self {
            Message::Command(command) => &command.trace_id,
            Message::Query(query) => &query.trace_id,
            Message::Record(record) => &record.trace_id,
        }
    }
}

pub(crate) fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
