//! Reliable propagation of factory domain events.
//!
//! Business code raises events on aggregates; a [`UnitOfWork`] writes the
//! aggregates and the harvested events to the outbox in one transaction.
//! The [`OutboxDispatcher`] then delivers each event at least once to its
//! handlers, among them the signed webhook notifier and the broker relay.
//!
//! ```text
//!  aggregate.raise(event)
//!          │
//!          ▼
//!  UnitOfWork::commit ──▶ aggregates + outbox (one transaction)
//!                                   │
//!                                   ▼
//!                        OutboxDispatcher::run_once
//!                         │                    │
//!                         ▼                    ▼
//!                 WebhookNotifier        BrokerRelay ──▶ BrokerConsumer
//!                         │                                    │
//!                         └──────────▶ WebhookSender ◀─────────┘
//! ```

pub mod broker;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod unit_of_work;
pub mod webhook;

#[doc(hidden)]
pub use chrono as __chrono;

pub use crate::broker::{
    Broker, BrokerConsumer, BrokerError, BrokerMessage, BrokerPublisher, BrokerRelay,
    InMemoryBroker,
};
pub use crate::config::{ConfigError, PipelineConfig, WebhookChannel};
pub use crate::core::{
    timestamp, Aggregate, AggregateId, AnyEvent, DomainEvent, Entity, Event,
};
pub use crate::dispatcher::{
    DispatcherConfig, DispatcherWorker, DrainResult, EventHandler, HandlerContext, HandlerError,
    HandlerRegistry, OutboxDispatcher,
};
pub use crate::pipeline::bind_webhook_channel;
pub use crate::registry::{
    EventRegistry, EventSerializer, RegistryError, SerializationError, SerializedEvent,
};
pub use crate::store::{
    InMemoryStore, OutboxRecord, OutboxStatus, Store, StoreError, Transaction,
};
pub use crate::unit_of_work::{CommitSummary, Tracked, UnitOfWork, UnitOfWorkError};
pub use crate::webhook::{
    InMemoryWebhookStore, WebhookError, WebhookEventMap, WebhookNotifier, WebhookSender,
    WebhookStore,
};
