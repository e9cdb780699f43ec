use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::core::{AnyEvent, DomainEvent};
use crate::registry::EventRegistry;
use crate::store::{OutboxRecord, Store};

/// Outcome of a failed handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient; the record is released for another attempt while attempts
    /// remain.
    #[error("retryable: {0}")]
    Retryable(String),
    /// The record is marked FAILED immediately.
    #[error("{0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        HandlerError::Terminal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// What a handler sees besides the event: the record being dispatched and the
/// transaction its side effects should use.
pub struct HandlerContext<'a, S: Store> {
    record: &'a OutboxRecord,
    tx: &'a mut S::Tx,
}

impl<'a, S: Store> HandlerContext<'a, S> {
    pub(crate) fn new(record: &'a OutboxRecord, tx: &'a mut S::Tx) -> Self {
        Self { record, tx }
    }

    pub fn record(&self) -> &OutboxRecord {
        self.record
    }

    /// Writes made here commit together with the record's DONE transition,
    /// and are rolled back if any handler for the record fails.
    pub fn transaction(&mut self) -> &mut S::Tx {
        self.tx
    }
}

#[async_trait]
pub trait EventHandler<S: Store>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, S>,
        event: &dyn AnyEvent,
    ) -> Result<(), HandlerError>;
}

/// Handlers keyed by event type, each list in registration order.
pub struct HandlerRegistry<S: Store> {
    handlers: HashMap<TypeId, Vec<Arc<dyn EventHandler<S>>>>,
}

impl<S: Store> HandlerRegistry<S> {
    pub fn builder() -> HandlerRegistryBuilder<S> {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn handlers_for(&self, type_id: TypeId) -> &[Arc<dyn EventHandler<S>>] {
        self.handlers
            .get(&type_id)
            .map(|handlers| handlers.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct HandlerRegistryBuilder<S: Store> {
    handlers: HashMap<TypeId, Vec<Arc<dyn EventHandler<S>>>>,
}

impl<S: Store> std::fmt::Debug for HandlerRegistryBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistryBuilder")
            .field("event_types", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl<S: Store> HandlerRegistryBuilder<S> {
    pub fn on<E: DomainEvent>(self, handler: Arc<dyn EventHandler<S>>) -> Self {
        self.on_type(TypeId::of::<E>(), handler)
    }

    pub fn on_type(mut self, type_id: TypeId, handler: Arc<dyn EventHandler<S>>) -> Self {
        self.handlers.entry(type_id).or_default().push(handler);
        self
    }

    /// Binds `handler` to every registered version of `name`.
    pub fn on_name(
        mut self,
        registry: &EventRegistry,
        name: &str,
        handler: Arc<dyn EventHandler<S>>,
    ) -> Self {
        let shapes = registry.versions_of(name);
        if shapes.is_empty() {
            warn!(
                event_name = name,
                handler = handler.name(),
                "no registered event by that name"
            );
        }
        for shape in shapes {
            self = self.on_type(shape.type_id(), handler.clone());
        }
        self
    }

    pub fn build(self) -> HandlerRegistry<S> {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}
