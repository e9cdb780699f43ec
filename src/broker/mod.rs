//! Broker bridge: publishes serialized events to a topic exchange and
//! consumes them into the webhook path.
//!
//! ## Topology
//!
//! ```text
//!   BrokerPublisher ──publish(routing key = event name)──▶ exchange (topic, durable)
//!                                                              │
//!                                                   binding "#"│
//!                                                              ▼
//!   BrokerConsumer ◀──fetch(prefetch)────────────────── queue (durable)
//!        │
//!        ├─ ok ──────────────▶ ack
//!        ├─ processing error ─▶ nack(requeue)
//!        └─ poison message ───▶ nack(no requeue) ──▶ dead letters
//! ```

mod consumer;
mod error;
mod in_memory;
#[cfg(feature = "nats")]
mod nats;
mod producer;
mod topic;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use consumer::{BrokerConsumer, ConsumeReport, ConsumerConfig};
pub use error::BrokerError;
pub use in_memory::{DeadLetter, InMemoryBroker};
#[cfg(feature = "nats")]
pub use nats::JetStreamBroker;
pub use producer::{
    BrokerPublisher, BrokerRelay, PublishOutcome, AGGREGATE_ID_HEADER, EVENT_NAME_HEADER,
    EVENT_VERSION_HEADER,
};
pub use topic::topic_matches;

/// A message as handed to or received from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrokerMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
}

impl BrokerMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A fetched, not yet settled message. Settle it with [`Broker::ack`] or
/// [`Broker::nack`] using `tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub routing_key: String,
    pub message: BrokerMessage,
    pub redelivered: bool,
}

/// Topic broker operations the bridge needs.
///
/// Declarations are idempotent. Exchanges and queues are durable.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declares `queue` and binds it to `exchange` with a topic `pattern`.
    async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError>;

    /// Takes up to `max` messages from `queue`; they stay unacknowledged
    /// until settled.
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, tag: u64) -> Result<(), BrokerError>;

    /// `requeue = false` drops the message to the dead-letter path.
    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError>;
}
