use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::error::WebhookError;
use super::model::{
    DeliveryStatus, NewDelivery, NewSubscription, WebhookDelivery, WebhookSubscription,
};
use super::store::WebhookStore;

fn storage(err: sqlx::Error) -> WebhookError {
    WebhookError::Storage(err.to_string())
}

fn non_negative(value: i32, column: &str) -> Result<u32, WebhookError> {
    u32::try_from(value).map_err(|_| WebhookError::Storage(format!("negative {column}: {value}")))
}

fn to_i32(value: u32, column: &str) -> Result<i32, WebhookError> {
    i32::try_from(value).map_err(|_| WebhookError::Storage(format!("{column} out of range: {value}")))
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    url: String,
    secret: String,
    event_filter: Vec<String>,
    is_active: bool,
    retry_count: i32,
    timeout_secs: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for WebhookSubscription {
    type Error = WebhookError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(WebhookSubscription {
            id: row.id,
            url: row.url,
            secret: row.secret,
            event_filter: row.event_filter.into_iter().collect(),
            is_active: row.is_active,
            retry_count: non_negative(row.retry_count, "retry_count")?,
            timeout_secs: non_negative(row.timeout_secs, "timeout_secs")?,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct DeliveryRow {
    id: i64,
    subscription_id: Uuid,
    event_type: String,
    payload: Json<Value>,
    status: String,
    attempts: i32,
    response_status: Option<i32>,
    response_body: Option<String>,
    error_message: Option<String>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = WebhookError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let response_status = row
            .response_status
            .map(|status| {
                u16::try_from(status)
                    .map_err(|_| WebhookError::Storage(format!("bad response_status {status}")))
            })
            .transpose()?;
        Ok(WebhookDelivery {
            id: row.id,
            subscription_id: row.subscription_id,
            event_type: row.event_type,
            payload: row.payload.0,
            status: DeliveryStatus::parse(&row.status)?,
            attempts: non_negative(row.attempts, "attempts")?,
            response_status,
            response_body: row.response_body,
            error_message: row.error_message,
            delivered_at: row.delivered_at,
            created_at: row.created_at,
        })
    }
}

/// [`WebhookStore`] over the `webhook_subscriptions` and
/// `webhook_deliveries` tables.
#[derive(Clone, Debug)]
pub struct PostgresWebhookStore {
    pool: PgPool,
}

impl PostgresWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookStore for PostgresWebhookStore {
    async fn create_subscription(
        &self,
        subscription: NewSubscription,
    ) -> Result<WebhookSubscription, WebhookError> {
        subscription.validate()?;
        let retry_count = to_i32(subscription.retry_count, "retry_count")?;
        let timeout_secs = to_i32(subscription.timeout_secs, "timeout_secs")?;
        let filter: Vec<String> = subscription.event_filter.iter().cloned().collect();

        let row: SubscriptionRow = sqlx::query_as(
            "INSERT INTO webhook_subscriptions \
             (id, url, secret, event_filter, is_active, retry_count, timeout_secs, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(&subscription.url)
        .bind(&subscription.secret)
        .bind(&filter)
        .bind(subscription.is_active)
        .bind(retry_count)
        .bind(timeout_secs)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        row.try_into()
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<bool, WebhookError> {
        let done = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(done.rows_affected() == 1)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<(), WebhookError> {
        let done = sqlx::query("UPDATE webhook_subscriptions SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if done.rows_affected() == 0 {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn set_event_filter(
        &self,
        id: Uuid,
        event_filter: BTreeSet<String>,
    ) -> Result<(), WebhookError> {
        let filter: Vec<String> = event_filter.into_iter().collect();
        let done = sqlx::query("UPDATE webhook_subscriptions SET event_filter = $2 WHERE id = $1")
            .bind(id)
            .bind(&filter)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if done.rows_affected() == 0 {
            return Err(WebhookError::SubscriptionNotFound(id));
        }
        Ok(())
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>, WebhookError> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM webhook_subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        row.map(WebhookSubscription::try_from).transpose()
    }

    async fn active_subscriptions_for(
        &self,
        event_type: &str,
    ) -> Result<Vec<WebhookSubscription>, WebhookError> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            "SELECT * FROM webhook_subscriptions \
             WHERE is_active AND event_filter @> ARRAY[$1]::text[] \
             ORDER BY created_at, id",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(WebhookSubscription::try_from).collect()
    }

    async fn create_delivery(&self, delivery: NewDelivery) -> Result<WebhookDelivery, WebhookError> {
        let row: DeliveryRow = sqlx::query_as(
            "INSERT INTO webhook_deliveries (subscription_id, event_type, payload, status, attempts) \
             VALUES ($1, $2, $3, 'PENDING', 0) \
             RETURNING *",
        )
        .bind(delivery.subscription_id)
        .bind(&delivery.event_type)
        .bind(Json(&delivery.payload))
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        row.try_into()
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        delivery.check()?;
        let done = sqlx::query(
            "UPDATE webhook_deliveries SET status = $2, attempts = $3, response_status = $4, \
             response_body = $5, error_message = $6, delivered_at = $7 \
             WHERE id = $1",
        )
        .bind(delivery.id)
        .bind(delivery.status.as_str())
        .bind(to_i32(delivery.attempts, "attempts")?)
        .bind(delivery.response_status.map(i32::from))
        .bind(&delivery.response_body)
        .bind(&delivery.error_message)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if done.rows_affected() == 0 {
            return Err(WebhookError::DeliveryNotFound(delivery.id));
        }
        Ok(())
    }

    async fn delivery(&self, id: i64) -> Result<Option<WebhookDelivery>, WebhookError> {
        let row: Option<DeliveryRow> =
            sqlx::query_as("SELECT * FROM webhook_deliveries WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        row.map(WebhookDelivery::try_from).transpose()
    }

    async fn deliveries_for(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, WebhookError> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            "SELECT * FROM webhook_deliveries WHERE subscription_id = $1 ORDER BY id",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }
}
