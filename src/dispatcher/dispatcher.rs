use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::handler::{HandlerContext, HandlerError, HandlerRegistry};
use crate::registry::{EventRegistry, EventSerializer};
use crate::store::{OutboxRecord, Store, StoreError, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    pub lease: Duration,
    pub max_attempts: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lease: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max;
        self
    }
}

/// Result of one claim-and-dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    pub claimed: usize,
    pub completed: usize,
    pub released: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Completed,
    Released,
    Failed,
}

/// Claims outbox records and runs the handlers registered for each.
///
/// Every record is dispatched in its own transaction; one record's failure
/// never stops the rest of the batch. Delivery is at-least-once: a worker
/// that dies mid-record leaves it PROCESSING until the lease expires, and the
/// next claim runs its handlers again.
pub struct OutboxDispatcher<S: Store> {
    store: S,
    serializer: EventSerializer,
    handlers: HandlerRegistry<S>,
    config: DispatcherConfig,
}

impl<S: Store> OutboxDispatcher<S> {
    pub fn new(
        store: S,
        registry: Arc<EventRegistry>,
        handlers: HandlerRegistry<S>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            serializer: EventSerializer::new(registry),
            handlers,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claims one batch and dispatches it.
    ///
    /// Fails only when the claim itself fails; errors while settling an
    /// individual record are logged and leave that record to lease expiry.
    pub async fn run_once(&self) -> Result<DrainResult, StoreError> {
        let records = self
            .store
            .claim(self.config.batch_size, self.config.lease)
            .await?;
        let mut result = DrainResult {
            claimed: records.len(),
            ..DrainResult::default()
        };
        if records.is_empty() {
            return Ok(result);
        }
        debug!(claimed = records.len(), "outbox batch claimed");

        for record in &records {
            match self.dispatch(record).await {
                Ok(RecordOutcome::Completed) => result.completed += 1,
                Ok(RecordOutcome::Released) => result.released += 1,
                Ok(RecordOutcome::Failed) => result.failed += 1,
                Err(err) => {
                    error!(
                        outbox_id = record.id,
                        event_name = %record.event_name,
                        error = %err,
                        "could not settle outbox record; it will be retried after lease expiry"
                    );
                }
            }
        }

        info!(
            claimed = result.claimed,
            completed = result.completed,
            released = result.released,
            failed = result.failed,
            "outbox batch dispatched"
        );
        Ok(result)
    }

    async fn dispatch(&self, record: &OutboxRecord) -> Result<RecordOutcome, StoreError> {
        let event = match self.serializer.deserialize_record(record) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    outbox_id = record.id,
                    event_name = %record.event_name,
                    event_version = record.event_version,
                    error = %err,
                    "outbox record cannot be deserialized"
                );
                self.store.mark_failed(record.id, &err.to_string()).await?;
                return Ok(RecordOutcome::Failed);
            }
        };

        let handlers = self.handlers.handlers_for(event.event_type());
        if handlers.is_empty() {
            let message = format!(
                "no handler registered for {} v{}",
                record.event_name, record.event_version
            );
            warn!(outbox_id = record.id, "{message}");
            self.store.mark_failed(record.id, &message).await?;
            return Ok(RecordOutcome::Failed);
        }

        let mut tx = self.store.begin().await?;
        let mut failure: Option<(String, HandlerError)> = None;
        {
            let mut ctx = HandlerContext::<S>::new(record, &mut tx);
            for handler in handlers {
                if let Err(err) = handler.handle(&mut ctx, event.as_ref()).await {
                    failure = Some((handler.name().to_string(), err));
                    break;
                }
            }
        }

        let Some((handler, err)) = failure else {
            tx.mark_done(record.id).await?;
            tx.commit().await?;
            debug!(outbox_id = record.id, event_name = %record.event_name, "outbox record done");
            return Ok(RecordOutcome::Completed);
        };

        if let Err(rollback) = tx.rollback().await {
            warn!(outbox_id = record.id, error = %rollback, "rollback of handler transaction failed");
        }

        let message = format!("handler {handler} failed: {err}");
        if err.is_retryable() && record.attempts < self.config.max_attempts {
            warn!(
                outbox_id = record.id,
                event_name = %record.event_name,
                attempts = record.attempts,
                max_attempts = self.config.max_attempts,
                handler = %handler,
                error = %err,
                "handler failed; releasing record for retry"
            );
            self.store.release(record.id, &message).await?;
            Ok(RecordOutcome::Released)
        } else {
            error!(
                outbox_id = record.id,
                event_name = %record.event_name,
                attempts = record.attempts,
                handler = %handler,
                error = %err,
                "handler failed; marking record failed"
            );
            self.store.mark_failed(record.id, &message).await?;
            Ok(RecordOutcome::Failed)
        }
    }
}
