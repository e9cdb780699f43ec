use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::collector::EventCollector;
use super::error::UnitOfWorkError;
use super::identity_map::{IdentityKey, IdentityMap};
use super::repository::TrackedRepository;
use super::tracked::Tracked;
use crate::core::Aggregate;
use crate::registry::{EventRegistry, EventSerializer};
use crate::store::{Store, Transaction};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub aggregates: usize,
    pub outbox_ids: Vec<i64>,
}

/// One business transaction: tracked aggregates plus the outbox rows for the
/// events they raised, committed atomically.
///
/// ```text
///   begin ──► repository::<A>().create / get / update   (register handles)
///     │
///     ▼
///   commit: flush snapshots ─► harvest events ─► insert outbox ─► COMMIT
///     │                                                             │
///     │ any failure: ROLLBACK, buffers untouched                    ▼
///     │                                  clear buffers, bump versions
///   rollback: ROLLBACK, forget handles, buffers untouched
/// ```
///
/// Dropping a unit of work without committing discards its writes.
pub struct UnitOfWork<S: Store> {
    tx: Option<S::Tx>,
    identity_map: IdentityMap,
    serializer: EventSerializer,
}

impl<S: Store> UnitOfWork<S> {
    pub async fn begin(store: &S, registry: Arc<EventRegistry>) -> Result<Self, UnitOfWorkError> {
        let tx = store.begin().await?;
        Ok(Self {
            tx: Some(tx),
            identity_map: IdentityMap::new(),
            serializer: EventSerializer::new(registry),
        })
    }

    pub fn repository<A: Aggregate>(&mut self) -> TrackedRepository<'_, S, A> {
        TrackedRepository::new(self)
    }

    /// Registers a handle obtained elsewhere.
    pub fn track<A: Aggregate>(&mut self, handle: &Tracked<A>) -> Result<(), UnitOfWorkError> {
        self.identity_map.register(handle)
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub(crate) fn identity_map_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity_map
    }

    /// The underlying store transaction, for writes outside the aggregate
    /// model.
    pub fn transaction(&mut self) -> Result<&mut S::Tx, UnitOfWorkError> {
        self.tx.as_mut().ok_or(UnitOfWorkError::Closed)
    }

    pub async fn commit(mut self) -> Result<CommitSummary, UnitOfWorkError> {
        let mut tx = self.tx.take().ok_or(UnitOfWorkError::Closed)?;

        let staged = Self::stage(&mut tx, &self.identity_map, &self.serializer).await;
        let (versions, outbox_ids) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                warn!(error = %err, "unit of work failed before commit; rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        };

        tx.commit().await?;

        for entry in self.identity_map.entries() {
            let Some(&version) = versions.get(entry.key()) else {
                continue;
            };
            for instance in entry.instances() {
                instance.mark_committed(version)?;
            }
        }
        let summary = CommitSummary {
            aggregates: self.identity_map.len(),
            outbox_ids,
        };
        self.identity_map.clear();

        info!(
            aggregates = summary.aggregates,
            events = summary.outbox_ids.len(),
            "unit of work committed"
        );
        Ok(summary)
    }

    pub async fn rollback(mut self) -> Result<(), UnitOfWorkError> {
        self.identity_map.clear();
        let tx = self.tx.take().ok_or(UnitOfWorkError::Closed)?;
        tx.rollback().await?;
        debug!("unit of work rolled back");
        Ok(())
    }

    /// Flushes snapshots and inserts outbox rows. Returns the version each
    /// identity will have once the transaction commits.
    async fn stage(
        tx: &mut S::Tx,
        identity_map: &IdentityMap,
        serializer: &EventSerializer,
    ) -> Result<(HashMap<IdentityKey, i64>, Vec<i64>), UnitOfWorkError> {
        let mut versions = HashMap::with_capacity(identity_map.len());
        for entry in identity_map.entries() {
            let Some(latest) = entry.latest() else {
                continue;
            };
            let snapshot = latest.snapshot()?;
            tx.save_aggregate(&snapshot).await?;
            versions.insert(entry.key().clone(), snapshot.version + 1);
        }

        let records = EventCollector::new(serializer).collect(identity_map)?;
        let outbox_ids = if records.is_empty() {
            Vec::new()
        } else {
            tx.insert_outbox(&records).await?
        };
        Ok((versions, outbox_ids))
    }
}
