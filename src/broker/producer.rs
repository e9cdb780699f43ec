use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::error::BrokerError;
use super::{Broker, BrokerMessage};
use crate::core::AnyEvent;
use crate::dispatcher::{EventHandler, HandlerContext, HandlerError};
use crate::registry::{EventRegistry, EventSerializer, SerializationError, SerializedEvent};
use crate::store::Store;

pub const EVENT_NAME_HEADER: &str = "event-name";
pub const EVENT_VERSION_HEADER: &str = "event-version";
pub const AGGREGATE_ID_HEADER: &str = "aggregate-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { routing_key: String },
    /// The event type is not registered; nothing was sent.
    Skipped,
}

/// Publishes serialized events to one topic exchange.
///
/// The routing key is the event name unless overridden. The exchange is
/// declared on first publish.
pub struct BrokerPublisher {
    broker: Arc<dyn Broker>,
    serializer: EventSerializer,
    exchange: String,
    routing_keys: HashMap<String, String>,
    declared: OnceCell<()>,
}

impl BrokerPublisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<EventRegistry>,
        exchange: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            serializer: EventSerializer::new(registry),
            exchange: exchange.into(),
            routing_keys: HashMap::new(),
            declared: OnceCell::new(),
        }
    }

    pub fn with_routing_key(
        mut self,
        event_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.routing_keys.insert(event_name.into(), routing_key.into());
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key_for<'a>(&'a self, event_name: &'a str) -> &'a str {
        self.routing_keys
            .get(event_name)
            .map(String::as_str)
            .unwrap_or(event_name)
    }

    pub async fn publish(&self, event: &dyn AnyEvent) -> Result<PublishOutcome, BrokerError> {
        match self.serializer.serialize(event) {
            Ok(serialized) => self.publish_serialized(&serialized).await,
            Err(SerializationError::UnregisteredShape { type_name }) => {
                warn!(type_name = %type_name, "event type not registered, not published");
                Ok(PublishOutcome::Skipped)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn publish_serialized(
        &self,
        event: &SerializedEvent,
    ) -> Result<PublishOutcome, BrokerError> {
        self.declared
            .get_or_try_init(|| self.broker.declare_exchange(&self.exchange))
            .await?;

        let routing_key = self.routing_key_for(&event.event_name).to_string();
        let message = BrokerMessage::new(serde_json::to_vec(event)?)
            .with_header(EVENT_NAME_HEADER, event.event_name.as_str())
            .with_header(EVENT_VERSION_HEADER, event.event_version.to_string())
            .with_header(AGGREGATE_ID_HEADER, event.aggregate_id.as_str())
            .persistent();

        self.broker
            .publish(&self.exchange, &routing_key, message)
            .await?;
        debug!(
            exchange = %self.exchange,
            routing_key = %routing_key,
            aggregate_id = %event.aggregate_id,
            "event published"
        );
        Ok(PublishOutcome::Published { routing_key })
    }
}

/// Forwards dispatched outbox records to the broker.
pub struct BrokerRelay {
    publisher: BrokerPublisher,
}

impl BrokerRelay {
    pub fn new(publisher: BrokerPublisher) -> Self {
        Self { publisher }
    }

    pub fn publisher(&self) -> &BrokerPublisher {
        &self.publisher
    }
}

#[async_trait]
impl<S: Store> EventHandler<S> for BrokerRelay {
    fn name(&self) -> &str {
        "broker-relay"
    }

    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, S>,
        _event: &dyn AnyEvent,
    ) -> Result<(), HandlerError> {
        let event = ctx.record().to_serialized();
        self.publisher
            .publish_serialized(&event)
            .await
            .map(|_| ())
            .map_err(|err| HandlerError::retryable(err.to_string()))
    }
}
