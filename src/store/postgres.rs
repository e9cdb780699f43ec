use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres};
use tracing::debug;

use super::error::StoreError;
use super::record::{NewOutboxRecord, OutboxRecord, OutboxStatus, StoredAggregate};
use super::{Store, Transaction};

pub(crate) fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(FromRow)]
struct OutboxRow {
    id: i64,
    event_name: String,
    event_version: i32,
    aggregate_id: String,
    payload: Json<Map<String, Value>>,
    occurred_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    dedup_key: String,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxRecord {
            id: row.id,
            event_name: row.event_name,
            event_version: row.event_version,
            aggregate_id: row.aggregate_id,
            payload: row.payload.0,
            occurred_at: row.occurred_at,
            status: OutboxStatus::parse(&row.status)?,
            attempts: row.attempts,
            locked_until: row.locked_until,
            processed_at: row.processed_at,
            last_error: row.last_error,
            dedup_key: row.dedup_key,
        })
    }
}

fn into_records(rows: Vec<OutboxRow>) -> Result<Vec<OutboxRecord>, StoreError> {
    rows.into_iter().map(OutboxRecord::try_from).collect()
}

/// [`Store`] on PostgreSQL via a sqlx pool.
///
/// Schema lives in `migrations/`; run [`PostgresStore::migrate`] once at
/// startup.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.to_string()))
    }
}

pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn current_version(&mut self, kind: &str, id: &str) -> Result<i64, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM aggregates WHERE kind = $1 AND id = $2")
                .bind(kind)
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(db_error)?;
        Ok(version.unwrap_or(0))
    }

    /// Runs a guarded status update; zero affected rows means the record is
    /// missing or not in a state the transition accepts.
    async fn transition(
        &mut self,
        id: i64,
        to: OutboxStatus,
        sql: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut query = sqlx::query(sql).bind(id);
        if let Some(error) = error {
            query = query.bind(error);
        }
        let done = query.execute(&mut *self.tx).await.map_err(db_error)?;
        if done.rows_affected() == 1 {
            return Ok(());
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM outbox WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error)?;
        match status {
            None => Err(StoreError::NotFound(id)),
            Some(status) => Err(StoreError::InvalidTransition {
                id,
                from: OutboxStatus::parse(&status)?,
                to,
            }),
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(PostgresTransaction { tx })
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn load_aggregate(
        &mut self,
        kind: &str,
        id: &str,
    ) -> Result<Option<StoredAggregate>, StoreError> {
        let row: Option<(i64, Json<Value>)> = sqlx::query_as(
            "SELECT version, state FROM aggregates WHERE kind = $1 AND id = $2 FOR UPDATE",
        )
        .bind(kind)
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error)?;

        Ok(row.map(|(version, state)| StoredAggregate {
            kind: kind.to_string(),
            id: id.to_string(),
            version,
            state: state.0,
        }))
    }

    async fn save_aggregate(&mut self, aggregate: &StoredAggregate) -> Result<(), StoreError> {
        let result = if aggregate.version == 0 {
            sqlx::query(
                "INSERT INTO aggregates (kind, id, version, state, updated_at) \
                 VALUES ($1, $2, 1, $3, now()) \
                 ON CONFLICT (kind, id) DO NOTHING",
            )
            .bind(&aggregate.kind)
            .bind(&aggregate.id)
            .bind(Json(&aggregate.state))
            .execute(&mut *self.tx)
            .await
        } else {
            sqlx::query(
                "UPDATE aggregates SET version = version + 1, state = $3, updated_at = now() \
                 WHERE kind = $1 AND id = $2 AND version = $4",
            )
            .bind(&aggregate.kind)
            .bind(&aggregate.id)
            .bind(Json(&aggregate.state))
            .bind(aggregate.version)
            .execute(&mut *self.tx)
            .await
        };
        let result = result.map_err(db_error)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let actual = self.current_version(&aggregate.kind, &aggregate.id).await?;
        Err(StoreError::ConcurrentWrite {
            kind: aggregate.kind.clone(),
            id: aggregate.id.clone(),
            expected: aggregate.version,
            actual,
        })
    }

    async fn insert_outbox(&mut self, records: &[NewOutboxRecord]) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO outbox \
                 (event_name, event_version, aggregate_id, payload, occurred_at, status, attempts, dedup_key) \
                 VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6) \
                 RETURNING id",
            )
            .bind(&record.event_name)
            .bind(record.event_version)
            .bind(&record.aggregate_id)
            .bind(Json(&record.payload))
            .bind(record.occurred_at)
            .bind(&record.dedup_key)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::DuplicateEvent(record.dedup_key.clone())
                } else {
                    db_error(err)
                }
            })?;
            ids.push(id);
        }
        debug!(count = ids.len(), "outbox rows staged");
        Ok(ids)
    }

    async fn claim(
        &mut self,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "WITH candidates AS ( \
                 SELECT id FROM outbox \
                 WHERE status = 'PENDING' \
                    OR (status = 'PROCESSING' AND locked_until < now()) \
                 ORDER BY occurred_at, id \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE outbox \
             SET status = 'PROCESSING', \
                 attempts = outbox.attempts + 1, \
                 locked_until = now() + make_interval(secs => $2) \
             FROM candidates \
             WHERE outbox.id = candidates.id \
             RETURNING outbox.*",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(lease.as_secs_f64())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;

        let mut claimed = into_records(rows)?;
        claimed.sort_by(|a, b| (a.occurred_at, a.id).cmp(&(b.occurred_at, b.id)));
        Ok(claimed)
    }

    async fn mark_done(&mut self, id: i64) -> Result<(), StoreError> {
        self.transition(
            id,
            OutboxStatus::Done,
            "UPDATE outbox SET status = 'DONE', processed_at = now(), locked_until = NULL, \
             last_error = NULL WHERE id = $1 AND status <> 'FAILED'",
            None,
        )
        .await
    }

    async fn mark_failed(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.transition(
            id,
            OutboxStatus::Failed,
            "UPDATE outbox SET status = 'FAILED', locked_until = NULL, last_error = $2 \
             WHERE id = $1 AND status <> 'DONE'",
            Some(error),
        )
        .await
    }

    async fn release(&mut self, id: i64, error: &str) -> Result<(), StoreError> {
        self.transition(
            id,
            OutboxStatus::Pending,
            "UPDATE outbox SET status = 'PENDING', locked_until = NULL, last_error = $2 \
             WHERE id = $1 AND status = 'PROCESSING'",
            Some(error),
        )
        .await
    }

    async fn retry_failed(&mut self, id: i64) -> Result<(), StoreError> {
        self.transition(
            id,
            OutboxStatus::Pending,
            "UPDATE outbox SET status = 'PENDING', locked_until = NULL, last_error = NULL \
             WHERE id = $1 AND status = 'FAILED'",
            None,
        )
        .await
    }

    async fn get_outbox(&mut self, id: i64) -> Result<Option<OutboxRecord>, StoreError> {
        let row: Option<OutboxRow> = sqlx::query_as("SELECT * FROM outbox WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_error)?;
        row.map(OutboxRecord::try_from).transpose()
    }

    async fn list_outbox(
        &mut self,
        status: Option<OutboxStatus>,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "SELECT * FROM outbox WHERE ($1::text IS NULL OR status = $1) ORDER BY id",
        )
        .bind(status.map(|status| status.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error)?;
        into_records(rows)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_error)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(db_error)
    }
}
