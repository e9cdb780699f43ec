//! Transactional storage for aggregate snapshots and the outbox.
//!
//! A [`Store`] hands out [`Transaction`]s. Aggregate writes and outbox inserts
//! made through one transaction become visible together at `commit` or not
//! at all. [`Store`] also offers one-shot wrappers for the dispatcher's
//! single-statement transitions.

mod error;
mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;
mod record;

use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;
pub use in_memory::{InMemoryStore, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStore, PostgresTransaction};
pub use record::{NewOutboxRecord, OutboxRecord, OutboxStatus, StoredAggregate};

#[async_trait]
pub trait Transaction: Send {
    /// Loads a snapshot for writing. Postgres holds a row lock until the
    /// transaction ends.
    async fn load_aggregate(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredAggregate>, StoreError>;

    /// Writes `aggregate.state` as version `aggregate.version + 1`.
    ///
    /// Fails with [`StoreError::ConcurrentWrite`] when the stored version is
    /// no longer `aggregate.version`.
    async fn save_aggregate(&mut self, aggregate: &StoredAggregate) -> Result<(), StoreError>;

    /// Stages outbox rows; a `dedup_key` already present fails with
    /// [`StoreError::DuplicateEvent`].
    async fn insert_outbox(&mut self, records: &[NewOutboxRecord]) -> Result<Vec<i64>, StoreError>;

    /// Claims up to `limit` PENDING or lease-expired PROCESSING records,
    /// oldest `occurred_at` first, skipping rows a concurrent claimer holds.
    /// The claim belongs to the transaction and is undone by rollback.
    async fn claim(&mut self, limit: usize, lease: Duration)
        -> Result<Vec<OutboxRecord>, StoreError>;

    async fn mark_done(&mut self, id: i64) -> Result<(), StoreError>;
    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError>;
    async fn release(&mut self, id: i64, error: &str) -> Result<(), StoreError>;
    async fn retry_failed(&mut self, id: i64) -> Result<(), StoreError>;

    async fn get_outbox(&mut self, id: i64) -> Result<Option<OutboxRecord>, StoreError>;
    async fn list_outbox(
        &mut self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    type Tx: Transaction + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn claim(&self, limit: usize, lease: Duration) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut tx = self.begin().await?;
        let claimed = tx.claim(limit, lease).await?;
        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_done(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.mark_done(id).await?;
        tx.commit().await
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.mark_failed(id, error).await?;
        tx.commit().await
    }

    async fn release(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.release(id, error).await?;
        tx.commit().await
    }

    async fn retry_failed(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.retry_failed(id).await?;
        tx.commit().await
    }

    async fn outbox_record(&self, id: i64) -> Result<Option<OutboxRecord>, StoreError> {
        let mut tx = self.begin().await?;
        let record = tx.get_outbox(id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn outbox_records(
        &self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut tx = self.begin().await?;
        let records = tx.list_outbox(status).await?;
        tx.commit().await?;
        Ok(records)
    }
}
