use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed: {0}")]
    Malformed(&'static str),
    #[error("signature does not match")]
    Mismatch,
    #[error("invalid signing key")]
    InvalidKey,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),
    #[error("subscription {0} not found")]
    SubscriptionNotFound(Uuid),
    #[error("delivery {0} not found")]
    DeliveryNotFound(i64),
    #[error("delivery {id} is inconsistent: {reason}")]
    InvalidDelivery { id: i64, reason: String },
    #[error("webhook store lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("webhook storage error: {0}")]
    Storage(String),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
