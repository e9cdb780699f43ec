//! Outbound webhooks: subscriptions, signed delivery with retries, and the
//! per-attempt delivery audit trail.

mod error;
mod model;
mod notifier;
#[cfg(feature = "postgres")]
mod postgres;
mod sender;
mod signature;
mod store;

pub use error::{SignatureError, WebhookError};
pub use model::{
    DeliveryStatus, NewDelivery, NewSubscription, WebhookDelivery, WebhookSubscription,
    MAX_RESPONSE_BODY_CHARS,
};
pub use notifier::{NotifyReport, WebhookEventMap, WebhookNotifier};
#[cfg(feature = "postgres")]
pub use postgres::PostgresWebhookStore;
pub use sender::{SenderConfig, WebhookPayload, WebhookSender};
pub use signature::{
    canonical_json, sign, verify_signature, EVENT_HEADER, SIGNATURE_HEADER, SIGNATURE_PREFIX,
};
pub use store::{InMemoryWebhookStore, WebhookStore};
