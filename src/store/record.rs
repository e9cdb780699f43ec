use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::StoreError;
use crate::registry::SerializedEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Done => "DONE",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSING" => Ok(OutboxStatus::Processing),
            "DONE" => Ok(OutboxStatus::Done),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbox row not yet inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxRecord {
    pub event_name: String,
    pub event_version: i32,
    pub aggregate_id: String,
    pub payload: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
    pub dedup_key: String,
}

impl From<SerializedEvent> for NewOutboxRecord {
    fn from(event: SerializedEvent) -> Self {
        let dedup_key = event.dedup_key();
        NewOutboxRecord {
            event_name: event.event_name,
            event_version: event.event_version,
            aggregate_id: event.aggregate_id,
            payload: event.payload,
            occurred_at: event.occurred_at,
            dedup_key,
        }
    }
}

/// Durable copy of a domain event awaiting dispatch.
///
/// ```text
///   PENDING --claim--> PROCESSING --mark_done--> DONE
///      ^                  |  |
///      +----release-------+  +--mark_failed--> FAILED
///      ^                                         |
///      +---------------retry_failed--------------+
/// ```
///
/// A PROCESSING record whose lease expired is claimable again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_name: String,
    pub event_version: i32,
    pub aggregate_id: String,
    pub payload: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dedup_key: String,
}

impl OutboxRecord {
    pub(crate) fn from_new(id: i64, record: NewOutboxRecord) -> Self {
        OutboxRecord {
            id,
            event_name: record.event_name,
            event_version: record.event_version,
            aggregate_id: record.aggregate_id,
            payload: record.payload,
            occurred_at: record.occurred_at,
            status: OutboxStatus::Pending,
            attempts: 0,
            locked_until: None,
            processed_at: None,
            last_error: None,
            dedup_key: record.dedup_key,
        }
    }

    pub fn to_serialized(&self) -> SerializedEvent {
        SerializedEvent {
            event_name: self.event_name.clone(),
            event_version: self.event_version,
            aggregate_id: self.aggregate_id.clone(),
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Processing => self.locked_until.map_or(true, |until| until < now),
            OutboxStatus::Done | OutboxStatus::Failed => false,
        }
    }

    pub(crate) fn claim(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.status = OutboxStatus::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.locked_until = Some(lease_deadline(now, lease));
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status == OutboxStatus::Failed {
            return Err(self.invalid(OutboxStatus::Done));
        }
        self.status = OutboxStatus::Done;
        self.processed_at = Some(now);
        self.locked_until = None;
        self.last_error = None;
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: &str) -> Result<(), StoreError> {
        if self.status == OutboxStatus::Done {
            return Err(self.invalid(OutboxStatus::Failed));
        }
        self.status = OutboxStatus::Failed;
        self.locked_until = None;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    pub(crate) fn release(&mut self, error: &str) -> Result<(), StoreError> {
        if self.status != OutboxStatus::Processing {
            return Err(self.invalid(OutboxStatus::Pending));
        }
        self.status = OutboxStatus::Pending;
        self.locked_until = None;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    pub(crate) fn redrive(&mut self) -> Result<(), StoreError> {
        if self.status != OutboxStatus::Failed {
            return Err(self.invalid(OutboxStatus::Pending));
        }
        self.status = OutboxStatus::Pending;
        self.locked_until = None;
        self.last_error = None;
        Ok(())
    }

    fn invalid(&self, to: OutboxStatus) -> StoreError {
        StoreError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }
}

pub(crate) fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Snapshot of an aggregate as persisted by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAggregate {
    pub kind: String,
    pub id: String,
    /// Version the snapshot was read at; 0 for an aggregate never saved.
    pub version: i64,
    pub state: Value,
}
