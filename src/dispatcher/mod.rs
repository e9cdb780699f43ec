//! Outbox dispatch: claim records, run handlers, settle each record.

mod dispatcher;
mod handler;
mod worker;

pub use dispatcher::{DispatcherConfig, DrainResult, OutboxDispatcher};
pub use handler::{
    EventHandler, HandlerContext, HandlerError, HandlerRegistry, HandlerRegistryBuilder,
};
pub use worker::{DispatcherWorker, WorkerStats};
