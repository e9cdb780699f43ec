//! [`Broker`] on NATS JetStream.
//!
//! An exchange is a stream capturing `<exchange>.>`; a routing key is the
//! subject suffix after the exchange name. A queue is a durable pull
//! consumer filtered by the binding pattern (`#` becomes `>`, allowed only
//! as the last word). `nack` without requeue terminates the message so the
//! server never redelivers it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_nats::jetstream::consumer::{pull, AckPolicy, Consumer};
use async_nats::jetstream::message::AckKind;
use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use super::error::BrokerError;
use super::topic::validate_pattern;
use super::{Broker, BrokerMessage, Delivery};

fn connection<E: std::fmt::Display>(err: E) -> BrokerError {
    BrokerError::Connection(err.to_string())
}

fn filter_subject(exchange: &str, pattern: &str) -> Result<String, BrokerError> {
    let words: Vec<&str> = pattern.split('.').collect();
    let last = words.len() - 1;
    let mut translated = Vec::with_capacity(words.len());
    for (index, word) in words.into_iter().enumerate() {
        match word {
            "#" if index == last => translated.push(">"),
            "#" => {
                return Err(BrokerError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "JetStream supports # only as the last word",
                })
            }
            other => translated.push(other),
        }
    }
    Ok(format!("{exchange}.{}", translated.join(".")))
}

struct Bound {
    exchange: String,
    consumer: Consumer<pull::Config>,
}

#[derive(Clone)]
pub struct JetStreamBroker {
    context: jetstream::Context,
    queues: Arc<Mutex<HashMap<String, Arc<Bound>>>>,
    unacked: Arc<Mutex<HashMap<u64, jetstream::Message>>>,
    next_tag: Arc<AtomicU64>,
}

impl JetStreamBroker {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            context: jetstream::new(client),
            queues: Arc::default(),
            unacked: Arc::default(),
            next_tag: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url).await.map_err(connection)?;
        Ok(Self::new(client))
    }

    fn bound(&self, queue: &str) -> Result<Arc<Bound>, BrokerError> {
        let queues = self
            .queues
            .lock()
            .map_err(|_| BrokerError::LockPoisoned("queue lookup"))?;
        queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    fn take(&self, tag: u64) -> Result<jetstream::Message, BrokerError> {
        self.unacked
            .lock()
            .map_err(|_| BrokerError::LockPoisoned("settle"))?
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.context
            .get_or_create_stream(stream::Config {
                name: exchange.to_string(),
                subjects: vec![format!("{exchange}.>")],
                ..Default::default()
            })
            .await
            .map_err(connection)?;
        debug!(exchange, "stream ready");
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        validate_pattern(pattern)?;
        let filter = filter_subject(exchange, pattern)?;
        let stream = self
            .context
            .get_stream(exchange)
            .await
            .map_err(|_| BrokerError::UnknownExchange(exchange.to_string()))?;
        let consumer = stream
            .get_or_create_consumer(
                queue,
                pull::Config {
                    durable_name: Some(queue.to_string()),
                    filter_subject: filter.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(connection)?;

        self.queues
            .lock()
            .map_err(|_| BrokerError::LockPoisoned("declare queue"))?
            .insert(
                queue.to_string(),
                Arc::new(Bound {
                    exchange: exchange.to_string(),
                    consumer,
                }),
            );
        debug!(queue, filter = %filter, "durable consumer ready");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        let mut headers = async_nats::HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        self.context
            .publish_with_headers(
                format!("{exchange}.{routing_key}"),
                headers,
                message.body.into(),
            )
            .await
            .map_err(connection)?
            .await
            .map_err(connection)?;
        Ok(())
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let bound = self.bound(queue)?;
        let mut batch = bound
            .consumer
            .fetch()
            .max_messages(max)
            .messages()
            .await
            .map_err(connection)?;

        let prefix = format!("{}.", bound.exchange);
        let mut deliveries = Vec::new();
        while let Some(message) = batch.next().await {
            let message = message.map_err(connection)?;
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;

            let mut headers = BTreeMap::new();
            if let Some(nats_headers) = &message.headers {
                for (name, values) in nats_headers.iter() {
                    if let Some(value) = values.first() {
                        headers.insert(name.to_string(), value.to_string());
                    }
                }
            }
            let subject = message.subject.to_string();
            let redelivered = message.info().map(|info| info.delivered > 1).unwrap_or(false);

            deliveries.push(Delivery {
                tag,
                routing_key: subject
                    .strip_prefix(&prefix)
                    .unwrap_or(&subject)
                    .to_string(),
                message: BrokerMessage {
                    body: message.payload.to_vec(),
                    headers,
                    persistent: true,
                },
                redelivered,
            });
            self.unacked
                .lock()
                .map_err(|_| BrokerError::LockPoisoned("fetch"))?
                .insert(tag, message);
        }
        Ok(deliveries)
    }

    async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        let message = self.take(tag)?;
        message.ack().await.map_err(connection)
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let message = self.take(tag)?;
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        message.ack_with(kind).await.map_err(connection)
    }
}
