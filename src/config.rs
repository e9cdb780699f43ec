//! Environment-driven pipeline settings.
//!
//! | variable                  | default            |
//! |---------------------------|--------------------|
//! | `DATABASE_URL`            | unset              |
//! | `OUTBOX_BATCH_SIZE`       | 10                 |
//! | `OUTBOX_LEASE_SECS`       | 60                 |
//! | `OUTBOX_POLL_INTERVAL_MS` | 1000               |
//! | `OUTBOX_MAX_ATTEMPTS`     | 5                  |
//! | `WEBHOOK_BASE_DELAY_MS`   | 1000               |
//! | `BROKER_EXCHANGE`         | `domain_events`    |
//! | `BROKER_QUEUE`            | `webhook_delivery` |
//! | `BROKER_PREFETCH`         | 10                 |
//! | `WEBHOOK_CHANNEL`         | `outbox`           |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::broker::ConsumerConfig;
use crate::dispatcher::DispatcherConfig;
use crate::webhook::SenderConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} = {value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which path feeds webhook deliveries. Exactly one is active so each event
/// is delivered to a subscription through one channel only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookChannel {
    /// The outbox dispatcher runs the webhook notifier as a handler.
    #[default]
    Outbox,
    /// The dispatcher relays to the broker; a broker consumer notifies.
    Broker,
}

impl FromStr for WebhookChannel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "outbox" => Ok(WebhookChannel::Outbox),
            "broker" => Ok(WebhookChannel::Broker),
            _ => Err("expected \"outbox\" or \"broker\"".to_string()),
        }
    }
}

impl fmt::Display for WebhookChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebhookChannel::Outbox => "outbox",
            WebhookChannel::Broker => "broker",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub dispatcher: DispatcherConfig,
    pub poll_interval: Duration,
    pub sender: SenderConfig,
    pub consumer: ConsumerConfig,
    pub webhook_channel: WebhookChannel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            dispatcher: DispatcherConfig::default(),
            poll_interval: Duration::from_millis(1000),
            sender: SenderConfig::default(),
            consumer: ConsumerConfig::default(),
            webhook_channel: WebhookChannel::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the configuration from any variable source; unset or blank
    /// variables take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let batch_size: usize = parse(&get, "OUTBOX_BATCH_SIZE", defaults.dispatcher.batch_size)?;
        let lease_secs: u64 = parse(
            &get,
            "OUTBOX_LEASE_SECS",
            defaults.dispatcher.lease.as_secs(),
        )?;
        let max_attempts: i32 = parse(
            &get,
            "OUTBOX_MAX_ATTEMPTS",
            defaults.dispatcher.max_attempts,
        )?;
        let poll_ms: u64 = parse(&get, "OUTBOX_POLL_INTERVAL_MS", 1000)?;
        let base_delay_ms: u64 = parse(&get, "WEBHOOK_BASE_DELAY_MS", 1000)?;
        let prefetch: usize = parse(&get, "BROKER_PREFETCH", defaults.consumer.prefetch)?;
        let webhook_channel: WebhookChannel =
            parse(&get, "WEBHOOK_CHANNEL", defaults.webhook_channel)?;

        positive("OUTBOX_BATCH_SIZE", batch_size as u64)?;
        positive("OUTBOX_LEASE_SECS", lease_secs)?;
        positive("OUTBOX_MAX_ATTEMPTS", u64::try_from(max_attempts).unwrap_or(0))?;
        positive("BROKER_PREFETCH", prefetch as u64)?;

        let mut consumer = defaults.consumer.with_prefetch(prefetch);
        if let Some(exchange) = get("BROKER_EXCHANGE") {
            consumer = consumer.with_exchange(exchange);
        }
        if let Some(queue) = get("BROKER_QUEUE") {
            consumer = consumer.with_queue(queue);
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            dispatcher: DispatcherConfig::default()
                .with_batch_size(batch_size)
                .with_lease(Duration::from_secs(lease_secs))
                .with_max_attempts(max_attempts),
            poll_interval: Duration::from_millis(poll_ms),
            sender: SenderConfig::default().with_base_delay(Duration::from_millis(base_delay_ms)),
            consumer,
            webhook_channel,
        })
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            reason: err.to_string(),
            value,
        }),
    }
}

fn positive(var: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
