use thiserror::Error;

use crate::registry::SerializationError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum UnitOfWorkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("failed to encode aggregate {kind} {id}: {message}")]
    AggregateEncoding {
        kind: &'static str,
        id: String,
        message: String,
    },
    #[error("failed to decode aggregate {kind} {id}: {message}")]
    AggregateDecoding {
        kind: &'static str,
        id: String,
        message: String,
    },
    #[error("{kind} aggregate has no id")]
    MissingId { kind: &'static str },
    #[error("aggregate lock poisoned")]
    LockPoisoned,
    #[error("unit of work already finished")]
    Closed,
}
