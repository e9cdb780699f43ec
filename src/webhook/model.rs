use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::WebhookError;

/// Stored response bodies are cut to this many characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, WebhookError> {
        match raw {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SUCCESS" => Ok(DeliveryStatus::Success),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(WebhookError::Storage(format!(
                "unknown delivery status {other:?}"
            ))),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
    pub event_filter: BTreeSet<String>,
    pub is_active: bool,
    pub retry_count: u32,
    pub timeout_secs: u32,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn accepts(&self, event_type: &str) -> bool {
        self.is_active && self.event_filter.contains(event_type)
    }

    /// Total HTTP attempts per delivery: the first try plus `retry_count`.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_secs))
    }
}

/// A subscription as requested, before validation and storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub url: String,
    pub secret: String,
    pub event_filter: BTreeSet<String>,
    pub is_active: bool,
    pub retry_count: u32,
    pub timeout_secs: u32,
}

impl NewSubscription {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            event_filter: BTreeSet::new(),
            is_active: true,
            retry_count: 3,
            timeout_secs: 10,
        }
    }

    pub fn with_events<I, T>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.event_filter.extend(events.into_iter().map(Into::into));
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn validate(&self) -> Result<(), WebhookError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|err| WebhookError::InvalidSubscription(format!("url {:?}: {err}", self.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::InvalidSubscription(format!(
                "url scheme must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.secret.is_empty() {
            return Err(WebhookError::InvalidSubscription(
                "secret must not be empty".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(WebhookError::InvalidSubscription(
                "timeout_secs must be positive".into(),
            ));
        }
        if self.event_filter.iter().any(|event| event.trim().is_empty()) {
            return Err(WebhookError::InvalidSubscription(
                "event filter contains an empty event type".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn into_subscription(self, id: Uuid, created_at: DateTime<Utc>) -> WebhookSubscription {
        WebhookSubscription {
            id,
            url: self.url,
            secret: self.secret,
            event_filter: self.event_filter,
            is_active: self.is_active,
            retry_count: self.retry_count,
            timeout_secs: self.timeout_secs,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDelivery {
    pub subscription_id: Uuid,
    pub event_type: String,
    pub payload: Value,
}

/// Audit row for one event sent to one subscription.
///
/// SUCCESS always has `delivered_at` and `response_status`; no other status
/// has `delivered_at`. A FAILED delivery keeps the last HTTP status it saw,
/// if any.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookDelivery {
    pub id: i64,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub(crate) fn pending(id: i64, new: NewDelivery, created_at: DateTime<Utc>) -> Self {
        WebhookDelivery {
            id,
            subscription_id: new.subscription_id,
            event_type: new.event_type,
            payload: new.payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_status: None,
            response_body: None,
            error_message: None,
            delivered_at: None,
            created_at,
        }
    }

    pub(crate) fn record_retry(&mut self, error: String) {
        self.status = DeliveryStatus::Pending;
        self.error_message = Some(error);
    }

    pub(crate) fn succeed(&mut self, status: u16, body: &str, at: DateTime<Utc>) {
        self.status = DeliveryStatus::Success;
        self.response_status = Some(status);
        self.response_body = Some(truncate_chars(body, MAX_RESPONSE_BODY_CHARS));
        self.error_message = None;
        self.delivered_at = Some(at);
    }

    pub(crate) fn fail(&mut self, error: String, response_status: Option<u16>) {
        self.status = DeliveryStatus::Failed;
        self.response_status = response_status;
        self.error_message = Some(error);
        self.delivered_at = None;
    }

    pub fn check(&self) -> Result<(), WebhookError> {
        let invalid = |reason: &str| WebhookError::InvalidDelivery {
            id: self.id,
            reason: reason.to_string(),
        };
        match self.status {
            DeliveryStatus::Success if self.delivered_at.is_none() => {
                Err(invalid("SUCCESS without delivered_at"))
            }
            DeliveryStatus::Success if self.response_status.is_none() => {
                Err(invalid("SUCCESS without response_status"))
            }
            DeliveryStatus::Pending | DeliveryStatus::Failed if self.delivered_at.is_some() => {
                Err(invalid("delivered_at set on an undelivered row"))
            }
            _ if self
                .response_status
                .is_some_and(|status| !(100..=599).contains(&status)) =>
            {
                Err(invalid("response_status outside 100..=599"))
            }
            _ => Ok(()),
        }
    }
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
