use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::error::StoreError;
use super::record::{NewOutboxRecord, OutboxRecord, OutboxStatus, StoredAggregate};
use super::{Store, Transaction};

#[derive(Default)]
struct MemoryState {
    aggregates: HashMap<(String, String), (i64, Value)>,
    outbox: BTreeMap<i64, OutboxRecord>,
    dedup_keys: HashSet<String>,
    held: HashSet<i64>,
    next_id: i64,
}

/// Single-process [`Store`] backed by shared maps.
///
/// Writes are staged inside the transaction and validated again when it
/// commits, so a rolled back or dropped transaction leaves no trace. Claims
/// are staged too: claimed records stay held by the transaction until it
/// ends, and other claimers skip them the way `SKIP LOCKED` skips locked
/// rows. Rollback returns them to their previous state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

enum Transition {
    Done,
    Failed(String),
    Release(String),
    Redrive,
}

impl Transition {
    fn apply(&self, record: &mut OutboxRecord, now: DateTime<Utc>) -> Result<(), StoreError> {
        match self {
            Transition::Done => record.complete(now),
            Transition::Failed(error) => record.fail(error),
            Transition::Release(error) => record.release(error),
            Transition::Redrive => record.redrive(),
        }
    }
}

enum Staged {
    Aggregate(StoredAggregate),
    Outbox(OutboxRecord),
    Claim(OutboxRecord),
    Transition(i64, Transition),
}

pub struct InMemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    staged: Vec<Staged>,
    held: Vec<i64>,
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for id in &self.held {
            state.held.remove(id);
        }
    }
}

impl InMemoryTransaction {
    fn staged_keys(&self) -> impl Iterator<Item = &str> {
        self.staged.iter().filter_map(|write| match write {
            Staged::Outbox(record) => Some(record.dedup_key.as_str()),
            _ => None,
        })
    }

    fn stage_transition(&mut self, id: i64, transition: Transition) -> Result<(), StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        if !state.outbox.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        drop(state);
        self.staged.push(Staged::Transition(id, transition));
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            state: self.state.clone(),
            staged: Vec::new(),
            held: Vec::new(),
        })
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn load_aggregate(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredAggregate>, StoreError> {
        let staged = self.staged.iter().rev().find_map(|write| match write {
            Staged::Aggregate(aggregate) if aggregate.kind == kind && aggregate.id == id => {
                Some(StoredAggregate {
                    kind: aggregate.kind.clone(),
                    id: aggregate.id.clone(),
                    version: aggregate.version + 1,
                    state: aggregate.state.clone(),
                })
            }
            _ => None,
        });
        if staged.is_some() {
            return Ok(staged);
        }

        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("aggregate read"))?;
        Ok(state
            .aggregates
            .get(&(kind.to_string(), id.to_string()))
            .map(|(version, snapshot)| StoredAggregate {
                kind: kind.to_string(),
                id: id.to_string(),
                version: *version,
                state: snapshot.clone(),
            }))
    }

    async fn save_aggregate(&mut self, aggregate: &StoredAggregate) -> Result<(), StoreError> {
        self.staged.push(Staged::Aggregate(aggregate.clone()));
        Ok(())
    }

    async fn insert_outbox(&mut self, records: &[NewOutboxRecord]) -> Result<Vec<i64>, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox write"))?;

        let mut ids = Vec::with_capacity(records.len());
        let mut staged = Vec::with_capacity(records.len());
        for record in records {
            let key = record.dedup_key.as_str();
            if state.dedup_keys.contains(key) || self.staged_keys().any(|staged| staged == key) {
                return Err(StoreError::DuplicateEvent(record.dedup_key.clone()));
            }
            state.next_id += 1;
            ids.push(state.next_id);
            staged.push(Staged::Outbox(OutboxRecord::from_new(
                state.next_id,
                record.clone(),
            )));
        }
        drop(state);

        self.staged.extend(staged);
        Ok(ids)
    }

    async fn claim(
        &mut self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox claim"))?;
        let now = Utc::now();

        let mut candidates: Vec<(DateTime<Utc>, i64)> = state
            .outbox
            .values()
            .filter(|record| record.is_claimable(now) && !state.held.contains(&record.id))
            .map(|record| (record.occurred_at, record.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates.into_iter().take(limit) {
            if let Some(current) = state.outbox.get(&id) {
                let mut record = current.clone();
                record.claim(now, lease);
                claimed.push(record);
            }
        }
        for record in &claimed {
            state.held.insert(record.id);
        }
        drop(state);

        self.held.extend(claimed.iter().map(|record| record.id));
        self.staged.extend(claimed.iter().cloned().map(Staged::Claim));
        Ok(claimed)
    }

    async fn mark_done(&mut self, id: i64) -> Result<(), StoreError> {
        self.stage_transition(id, Transition::Done)
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.stage_transition(id, Transition::Failed(error.to_string()))
    }

    async fn release(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.stage_transition(id, Transition::Release(error.to_string()))
    }

    async fn retry_failed(&mut self, id: i64) -> Result<(), StoreError> {
        self.stage_transition(id, Transition::Redrive)
    }

    async fn get_outbox(&mut self, id: i64) -> Result<Option<OutboxRecord>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state.outbox.get(&id).cloned())
    }

    async fn list_outbox(
        &mut self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state
            .outbox
            .values()
            .filter(|record| status.map_or(true, |status| record.status == status))
            .cloned()
            .collect())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("commit"))?;
        let now = Utc::now();

        let mut aggregates: Vec<((String, String), i64, Value)> = Vec::new();
        let mut records: BTreeMap<i64, OutboxRecord> = BTreeMap::new();
        let mut inserted_keys: HashSet<String> = HashSet::new();

        for write in std::mem::take(&mut self.staged) {
            match write {
                Staged::Aggregate(aggregate) => {
                    let key = (aggregate.kind.clone(), aggregate.id.clone());
                    let current = aggregates
                        .iter()
                        .rev()
                        .find(|(staged, _, _)| *staged == key)
                        .map(|(_, version, _)| *version)
                        .or_else(|| state.aggregates.get(&key).map(|(version, _)| *version))
                        .unwrap_or(0);
                    if current != aggregate.version {
                        return Err(StoreError::ConcurrentWrite {
                            kind: aggregate.kind,
                            id: aggregate.id,
                            expected: aggregate.version,
                            actual: current,
                        });
                    }
                    aggregates.push((key, aggregate.version + 1, aggregate.state));
                }
                Staged::Outbox(record) => {
                    if state.dedup_keys.contains(&record.dedup_key)
                        || !inserted_keys.insert(record.dedup_key.clone())
                    {
                        return Err(StoreError::DuplicateEvent(record.dedup_key));
                    }
                    records.insert(record.id, record);
                }
                Staged::Claim(record) => {
                    records.insert(record.id, record);
                }
                Staged::Transition(id, transition) => {
                    let record = match records.entry(id) {
                        Entry::Occupied(entry) => entry.into_mut(),
                        Entry::Vacant(entry) => {
                            let current =
                                state.outbox.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
                            entry.insert(current)
                        }
                    };
                    transition.apply(record, now)?;
                }
            }
        }

        for (key, version, snapshot) in aggregates {
            state.aggregates.insert(key, (version, snapshot));
        }
        state.dedup_keys.extend(inserted_keys);
        for (id, record) in records {
            state.outbox.insert(id, record);
        }
        for id in self.held.drain(..) {
            state.held.remove(&id);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        drop(self);
        Ok(())
    }
}
