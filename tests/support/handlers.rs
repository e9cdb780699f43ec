#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use factory_events::store::StoredAggregate;
use factory_events::{
    AnyEvent, Event, EventHandler, HandlerContext, HandlerError, Store, Transaction,
};
use serde_json::json;

/// What a handler saw for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub outbox_id: i64,
    pub event_name: String,
    pub aggregate_id: String,
    pub attempts: i32,
}

/// Accepts everything and remembers it.
pub struct RecordingHandler {
    name: String,
    seen: Mutex<Vec<Seen>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl<S: Store> EventHandler<S> for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, S>,
        event: &dyn AnyEvent,
    ) -> Result<(), HandlerError> {
        let record = ctx.record();
        self.seen.lock().unwrap().push(Seen {
            outbox_id: record.id,
            event_name: record.event_name.clone(),
            aggregate_id: event.aggregate_id(),
            attempts: record.attempts,
        });
        Ok(())
    }
}

/// Always fails with the same error.
pub struct FailingHandler {
    error: HandlerError,
    calls: AtomicUsize,
}

impl FailingHandler {
    pub fn retryable(message: &str) -> Self {
        Self {
            error: HandlerError::retryable(message),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn terminal(message: &str) -> Self {
        Self {
            error: HandlerError::terminal(message),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Store> EventHandler<S> for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    async fn handle(
        &self,
        _ctx: &mut HandlerContext<'_, S>,
        _event: &dyn AnyEvent,
    ) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Fails with a retryable error for the first `failures` calls.
pub struct FlakyHandler {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Store> EventHandler<S> for FlakyHandler {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn handle(
        &self,
        _ctx: &mut HandlerContext<'_, S>,
        _event: &dyn AnyEvent,
    ) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(HandlerError::retryable(format!("flake {}", call + 1)));
        }
        Ok(())
    }
}

/// Writes a `projection` snapshot per event through the dispatch
/// transaction.
pub struct ProjectionHandler;

impl ProjectionHandler {
    pub const KIND: &'static str = "projection";
}

#[async_trait]
impl<S: Store> EventHandler<S> for ProjectionHandler {
    fn name(&self) -> &str {
        "projection"
    }

    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, S>,
        event: &dyn AnyEvent,
    ) -> Result<(), HandlerError> {
        let snapshot = StoredAggregate {
            kind: Self::KIND.to_string(),
            id: ctx.record().id.to_string(),
            version: 0,
            state: json!({ "aggregate_id": event.aggregate_id() }),
        };
        ctx.transaction()
            .save_aggregate(&snapshot)
            .await
            .map_err(|err| HandlerError::retryable(err.to_string()))
    }
}
