use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::error::WebhookError;
use super::model::{WebhookDelivery, WebhookSubscription};
use super::signature::{canonical_json, sign, EVENT_HEADER, SIGNATURE_HEADER};
use super::store::WebhookStore;
use crate::registry::SerializedEvent;

/// Body of every webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl WebhookPayload {
    /// `timestamp` is the event's `occurred_at`, so the payload is identical
    /// on every retry and redelivery.
    pub fn from_event(event_type: &str, event: &SerializedEvent) -> Self {
        Self {
            event: event_type.to_string(),
            timestamp: event.occurred_at,
            data: event.data(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Delay before the second attempt; doubles after each failure.
    pub base_delay: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
        }
    }
}

impl SenderConfig {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

struct Attempt {
    status: u16,
    body: String,
}

/// Delivers one payload to one subscription with signed, retried POSTs.
///
/// Outcomes are recorded on the delivery row after every attempt. Failures
/// end in a FAILED row and are never returned as errors.
pub struct WebhookSender {
    client: reqwest::Client,
    store: Arc<dyn WebhookStore>,
    config: SenderConfig,
}

impl WebhookSender {
    pub fn new(store: Arc<dyn WebhookStore>, config: SenderConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("factory-events/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client, store, config))
    }

    pub fn with_client(
        client: reqwest::Client,
        store: Arc<dyn WebhookStore>,
        config: SenderConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        mut delivery: WebhookDelivery,
    ) -> WebhookDelivery {
        let signed = canonical_json(&delivery.payload)
            .map_err(WebhookError::from)
            .and_then(|body| {
                let signature = sign(&body, &subscription.secret)?;
                Ok((body, signature))
            });
        let (body, signature) = match signed {
            Ok(signed) => signed,
            Err(err) => {
                warn!(delivery_id = delivery.id, error = %err, "webhook payload could not be signed");
                delivery.fail(err.to_string(), None);
                self.persist(&delivery).await;
                return delivery;
            }
        };

        let max_attempts = subscription.max_attempts();
        let mut last_error = String::new();
        let mut last_status = None;

        for attempt in 1..=max_attempts {
            delivery.attempts += 1;
            match self.post(subscription, &delivery.event_type, &body, &signature).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    delivery.succeed(response.status, &response.body, Utc::now());
                    self.persist(&delivery).await;
                    info!(
                        delivery_id = delivery.id,
                        subscription_id = %subscription.id,
                        event_type = %delivery.event_type,
                        attempt,
                        status = response.status,
                        "webhook delivered"
                    );
                    return delivery;
                }
                Ok(response) => {
                    last_error = format!("endpoint responded with HTTP {}", response.status);
                    last_status = Some(response.status);
                }
                Err(err) => {
                    last_error = err.to_string();
                    last_status = None;
                }
            }

            warn!(
                delivery_id = delivery.id,
                subscription_id = %subscription.id,
                attempt,
                max_attempts,
                status = ?last_status,
                error = %last_error,
                "webhook attempt failed"
            );

            if attempt < max_attempts {
                delivery.record_retry(last_error.clone());
                self.persist(&delivery).await;
                tokio::time::sleep(self.config.backoff(attempt)).await;
            }
        }

        delivery.fail(last_error, last_status);
        self.persist(&delivery).await;
        warn!(
            delivery_id = delivery.id,
            subscription_id = %subscription.id,
            attempts = delivery.attempts,
            "webhook delivery failed"
        );
        delivery
    }

    async fn post(
        &self,
        subscription: &WebhookSubscription,
        event_type: &str,
        body: &[u8],
        signature: &str,
    ) -> Result<Attempt, reqwest::Error> {
        let response = self
            .client
            .post(&subscription.url)
            .timeout(subscription.timeout())
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, event_type)
            .body(body.to_vec())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(Attempt { status, body })
    }

    async fn persist(&self, delivery: &WebhookDelivery) {
        if let Err(err) = self.store.update_delivery(delivery).await {
            warn!(delivery_id = delivery.id, error = %err, "could not record delivery attempt");
        }
    }
}
