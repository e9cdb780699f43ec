//! In-memory topic broker for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::error::BrokerError;
use super::topic::{topic_matches, validate_pattern};
use super::{Broker, BrokerMessage, Delivery};

#[derive(Debug, Clone)]
struct Queued {
    routing_key: String,
    message: BrokerMessage,
    redelivered: bool,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

/// A message rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub routing_key: String,
    pub message: BrokerMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<Queued>>,
    unacked: BTreeMap<u64, (String, Queued)>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
}

/// Topic exchanges, durable queues, an unacknowledged set and a dead-letter
/// list, all behind one lock.
///
/// Clones share the same broker.
///
/// ## Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use factory_events::broker::{Broker, BrokerMessage, InMemoryBroker};
///
/// let broker = InMemoryBroker::new();
/// broker.declare_exchange("domain_events").await.unwrap();
/// broker.declare_queue("audit", "domain_events", "batch.#").await.unwrap();
///
/// broker
///     .publish("domain_events", "batch.closed", BrokerMessage::new(b"{}".to_vec()))
///     .await
///     .unwrap();
///
/// let fetched = broker.fetch("audit", 10).await.unwrap();
/// assert_eq!(fetched[0].routing_key, "batch.closed");
/// broker.ack(fetched[0].tag).await.unwrap();
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, op: &'static str) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state.lock().map_err(|_| BrokerError::LockPoisoned(op))
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state("queue depth")
            .map(|state| state.queues.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.state("unacked count")
            .map(|state| state.unacked.len())
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state("dead letters")
            .map(|state| state.dead_letters.clone())
            .unwrap_or_default()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state("exchange lookup")
            .map(|state| state.exchanges.contains(exchange))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.state("declare exchange")?;
        if state.exchanges.insert(exchange.to_string()) {
            debug!(exchange, "exchange declared");
        }
        Ok(())
    }

    async fn declare_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        validate_pattern(pattern)?;
        let mut state = self.state("declare queue")?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }
        state.queues.entry(queue.to_string()).or_default();
        let bound = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.pattern == pattern && b.queue == queue);
        if !bound {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
            debug!(queue, exchange, pattern, "queue bound");
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.state("publish")?;
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        for queue in targets {
            state.queues.entry(queue).or_default().push_back(Queued {
                routing_key: routing_key.to_string(),
                message: message.clone(),
                redelivered: false,
            });
        }
        Ok(())
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut state = self.state("fetch")?;
        let state = &mut *state;
        let pending = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;

        let take = max.min(pending.len());
        let mut deliveries = Vec::with_capacity(take);
        for queued in pending.drain(..take) {
            state.next_tag += 1;
            let tag = state.next_tag;
            deliveries.push(Delivery {
                tag,
                routing_key: queued.routing_key.clone(),
                message: queued.message.clone(),
                redelivered: queued.redelivered,
            });
            state.unacked.insert(tag, (queue.to_string(), queued));
        }
        Ok(deliveries)
    }

    async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state("ack")?;
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery(tag))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state("nack")?;
        let (queue, mut queued) = state
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;

        if requeue {
            queued.redelivered = true;
            state.queues.entry(queue).or_default().push_front(queued);
        } else {
            debug!(queue = %queue, routing_key = %queued.routing_key, "message dead-lettered");
            state.dead_letters.push(DeadLetter {
                queue,
                routing_key: queued.routing_key,
                message: queued.message,
            });
        }
        Ok(())
    }
}
