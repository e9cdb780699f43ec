#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use factory_events::store::{
    InMemoryTransaction, NewOutboxRecord, OutboxRecord, OutboxStatus, StoredAggregate,
};
use factory_events::{InMemoryStore, Store, StoreError, Transaction};

/// An [`InMemoryStore`] whose commits fail while `fail_commits` is set.
/// A failed commit discards the transaction's writes.
#[derive(Clone, Default)]
pub struct FailingCommitStore {
    inner: InMemoryStore,
    fail_commits: Arc<AtomicBool>,
}

impl FailingCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

pub struct FailingTransaction {
    inner: InMemoryTransaction,
    fail_commit: bool,
}

#[async_trait]
impl Store for FailingCommitStore {
    type Tx = FailingTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(FailingTransaction {
            inner: self.inner.begin().await?,
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl Transaction for FailingTransaction {
    async fn load_aggregate(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredAggregate>, StoreError> {
        self.inner.load_aggregate(kind, id).await
    }

    async fn save_aggregate(&mut self, aggregate: &StoredAggregate) -> Result<(), StoreError> {
        self.inner.save_aggregate(aggregate).await
    }

    async fn insert_outbox(&mut self, records: &[NewOutboxRecord]) -> Result<Vec<i64>, StoreError> {
        self.inner.insert_outbox(records).await
    }

    async fn claim(
        &mut self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        self.inner.claim(limit, lease).await
    }

    async fn mark_done(&mut self, id: i64) -> Result<(), StoreError> {
        self.inner.mark_done(id).await
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.inner.mark_failed(id, error).await
    }

    async fn release(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.inner.release(id, error).await
    }

    async fn retry_failed(&mut self, id: i64) -> Result<(), StoreError> {
        self.inner.retry_failed(id).await
    }

    async fn get_outbox(&mut self, id: i64) -> Result<Option<OutboxRecord>, StoreError> {
        self.inner.get_outbox(id).await
    }

    async fn list_outbox(
        &mut self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        self.inner.list_outbox(status).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        if self.fail_commit {
            self.inner.rollback().await?;
            return Err(StoreError::Database("connection reset during commit".into()));
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}
