use thiserror::Error;

use crate::registry::SerializationError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("exchange {0:?} has not been declared")]
    UnknownExchange(String),
    #[error("queue {0:?} has not been declared")]
    UnknownQueue(String),
    #[error("no unacknowledged delivery with tag {0}")]
    UnknownDelivery(u64),
    #[error("invalid binding pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },
    #[error("broker lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("message encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
