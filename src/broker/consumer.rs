use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

use super::error::BrokerError;
use super::{Broker, Delivery};
use crate::registry::{EventRegistry, EventSerializer, SerializedEvent};
use crate::webhook::WebhookNotifier;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub exchange: String,
    pub queue: String,
    pub binding: String,
    /// Upper bound on messages fetched, and held unacknowledged, per poll.
    pub prefetch: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            exchange: "domain_events".to_string(),
            queue: "webhook_delivery".to_string(),
            binding: "#".to_string(),
            prefetch: 10,
        }
    }
}

impl ConsumerConfig {
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_binding(mut self, binding: impl Into<String>) -> Self {
        self.binding = binding.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeReport {
    pub fetched: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

impl ConsumeReport {
    fn absorb(&mut self, other: ConsumeReport) {
        self.fetched += other.fetched;
        self.acked += other.acked;
        self.requeued += other.requeued;
        self.dead_lettered += other.dead_lettered;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

/// Consumes serialized events from a durable queue and hands them to the
/// webhook notifier.
///
/// Bodies that do not parse, and events the registry does not know, are
/// rejected without requeue. Notifier errors requeue the message.
pub struct BrokerConsumer {
    broker: Arc<dyn Broker>,
    serializer: EventSerializer,
    notifier: Arc<WebhookNotifier>,
    config: ConsumerConfig,
    declared: OnceCell<()>,
}

impl BrokerConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<EventRegistry>,
        notifier: Arc<WebhookNotifier>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            serializer: EventSerializer::new(registry),
            notifier,
            config,
            declared: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    async fn declare(&self) -> Result<(), BrokerError> {
        self.declared
            .get_or_try_init(|| async {
                self.broker.declare_exchange(&self.config.exchange).await?;
                self.broker
                    .declare_queue(&self.config.queue, &self.config.exchange, &self.config.binding)
                    .await?;
                info!(
                    exchange = %self.config.exchange,
                    queue = %self.config.queue,
                    binding = %self.config.binding,
                    "broker consumer bound"
                );
                Ok::<(), BrokerError>(())
            })
            .await?;
        Ok(())
    }

    /// Fetches up to `prefetch` messages and settles each one.
    pub async fn run_once(&self) -> Result<ConsumeReport, BrokerError> {
        self.declare().await?;
        let deliveries = self
            .broker
            .fetch(&self.config.queue, self.config.prefetch)
            .await?;

        let mut report = ConsumeReport {
            fetched: deliveries.len(),
            ..ConsumeReport::default()
        };
        for delivery in deliveries {
            match self.handle(&delivery).await {
                Settle::Ack => {
                    self.broker.ack(delivery.tag).await?;
                    report.acked += 1;
                }
                Settle::Requeue => {
                    self.broker.nack(delivery.tag, true).await?;
                    report.requeued += 1;
                }
                Settle::DeadLetter => {
                    self.broker.nack(delivery.tag, false).await?;
                    report.dead_lettered += 1;
                }
            }
        }
        Ok(report)
    }

    async fn handle(&self, delivery: &Delivery) -> Settle {
        let event: SerializedEvent = match serde_json::from_slice(&delivery.message.body) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    tag = delivery.tag,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "unparseable broker message rejected"
                );
                return Settle::DeadLetter;
            }
        };

        if let Err(err) = self.serializer.deserialize(&event) {
            warn!(
                tag = delivery.tag,
                event_name = %event.event_name,
                event_version = event.event_version,
                error = %err,
                "unknown or malformed event rejected"
            );
            return Settle::DeadLetter;
        }

        match self.notifier.notify(&event).await {
            Ok(report) => {
                debug!(
                    tag = delivery.tag,
                    event_name = %event.event_name,
                    subscriptions = report.subscriptions,
                    "broker message processed"
                );
                Settle::Ack
            }
            Err(err) => {
                warn!(
                    tag = delivery.tag,
                    event_name = %event.event_name,
                    redelivered = delivery.redelivered,
                    error = %err,
                    "broker message processing failed, requeued"
                );
                Settle::Requeue
            }
        }
    }

    /// Polls until `shutdown` turns true, returning the accumulated report.
    ///
    /// A full fetch is followed immediately by another; broker errors back
    /// off exponentially up to 30 seconds.
    pub async fn run(
        &self,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumeReport {
        let mut total = ConsumeReport::default();
        let mut error_backoff = poll_interval;
        info!(queue = %self.config.queue, "broker consumer started");

        loop {
            let delay = match self.run_once().await {
                Ok(report) => {
                    total.absorb(report);
                    error_backoff = poll_interval;
                    if report.fetched > 0 && report.fetched >= self.config.prefetch {
                        Duration::ZERO
                    } else {
                        poll_interval
                    }
                }
                Err(err) => {
                    error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                    warn!(error = %err, backoff = ?error_backoff, "broker poll failed");
                    error_backoff
                }
            };

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            queue = %self.config.queue,
            acked = total.acked,
            requeued = total.requeued,
            dead_lettered = total.dead_lettered,
            "broker consumer stopped"
        );
        total
    }
}
