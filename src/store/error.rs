use thiserror::Error;

use super::record::OutboxStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("concurrent write on {kind} {id}: expected version {expected}, found {actual}")]
    ConcurrentWrite {
        kind: String,
        id: String,
        expected: i64,
        actual: i64,
    },
    #[error("outbox already holds event {0}")]
    DuplicateEvent(String),
    #[error("outbox record {0} not found")]
    NotFound(i64),
    #[error("outbox record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: OutboxStatus,
        to: OutboxStatus,
    },
    #[error("unknown outbox status {0:?}")]
    InvalidStatus(String),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Infrastructure failures a caller may retry as-is; everything else is a
    /// logical conflict or a bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::LockPoisoned(_))
    }
}
