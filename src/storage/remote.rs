//! Shared PostgreSQL store for outcome records.
//!
//! The remote table mirrors the local one, keyed by `(batch_id, item_path)`.
//! Inserts use `ON CONFLICT DO NOTHING`, so replaying the same rows is
//! harmless and sync is at-least-once with idempotent keys.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use super::{OutcomeSink, SinkError};
use crate::record::OutcomeRecord;

/// Postgres caps a statement at 65535 bind parameters; each row binds ten.
const MAX_ROWS_PER_STATEMENT: usize = 6000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const INSERT_COLUMNS: &str = "INSERT INTO outcome_records \
     (item_path, output_path, started_at, finished_at, duration_ms, \
      status, error_message, batch_id, node_id, process_id) ";

/// One connection's worth of transactional writes.
///
/// Writes accumulate in an open transaction until [`RemoteSession::commit`];
/// the next write opens a fresh transaction on the same connection.
#[async_trait]
pub trait RemoteSession: Send {
    /// Insert one record. Returns the number of new rows (0 or 1).
    async fn insert(&mut self, record: &OutcomeRecord) -> Result<u64, SinkError>;

    /// Bulk-copy a page of records. Returns the number of new rows.
    async fn copy_page(&mut self, records: &[OutcomeRecord]) -> Result<u64, SinkError>;

    /// Commit the open transaction, if any.
    async fn commit(&mut self) -> Result<(), SinkError>;

    /// Discard the open transaction, if any.
    async fn rollback(&mut self) -> Result<(), SinkError>;
}

/// A shared store that outcome records are replicated into.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn ensure_schema(&self) -> Result<(), SinkError>;

    async fn session(&self) -> Result<Box<dyn RemoteSession>, SinkError>;
}

#[derive(Clone)]
pub struct PgRemoteStore {
    pool: PgPool,
}

impl PgRemoteStore {
    pub async fn connect(connection_string: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(connection_string)
            .await?;
        info!(max_connections, "connected to remote store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outcome_records (
                id BIGSERIAL PRIMARY KEY,
                item_path TEXT NOT NULL,
                output_path TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                batch_id TEXT NOT NULL,
                node_id TEXT,
                process_id TEXT,
                synced_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT outcome_records_batch_item_key UNIQUE (batch_id, item_path)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outcome_records_started ON outcome_records (started_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("remote schema ready");
        Ok(())
    }

    async fn session(&self) -> Result<Box<dyn RemoteSession>, SinkError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession { conn, in_tx: false }))
    }
}

#[async_trait]
impl OutcomeSink for PgRemoteStore {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        RemoteStore::ensure_schema(self).await
    }

    async fn bulk_insert(&self, records: &[OutcomeRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let inserted = copy_rows(&mut tx, records).await?;
        tx.commit().await?;
        Ok(usize::try_from(inserted).unwrap_or(usize::MAX))
    }
}

/// Holds one pooled connection for its whole life, so every checkpoint of a
/// sync runs on the same backend.
struct PgSession {
    conn: PoolConnection<Postgres>,
    in_tx: bool,
}

impl PgSession {
    async fn begin(&mut self) -> Result<(), SinkError> {
        if !self.in_tx {
            sqlx::query("BEGIN").execute(&mut *self.conn).await?;
            self.in_tx = true;
        }
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // An open transaction must not go back to the pool.
        if self.in_tx {
            self.conn.close_on_drop();
        }
    }
}

#[async_trait]
impl RemoteSession for PgSession {
    async fn insert(&mut self, record: &OutcomeRecord) -> Result<u64, SinkError> {
        self.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO outcome_records
            (item_path, output_path, started_at, finished_at, duration_ms,
             status, error_message, batch_id, node_id, process_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (batch_id, item_path) DO NOTHING
            "#,
        )
        .bind(&record.item_path)
        .bind(&record.output_path)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.duration_ms_i64())
        .bind(record.status.as_str())
        .bind(&record.error_message)
        .bind(record.batch_id.to_string())
        .bind(&record.node_id)
        .bind(&record.process_id)
        .execute(&mut *self.conn)
        .await?;
        Ok(result.rows_affected())
    }

    async fn copy_page(&mut self, records: &[OutcomeRecord]) -> Result<u64, SinkError> {
        self.begin().await?;
        copy_rows(&mut self.conn, records).await
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        if self.in_tx {
            sqlx::query("COMMIT").execute(&mut *self.conn).await?;
            self.in_tx = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SinkError> {
        if self.in_tx {
            sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
            self.in_tx = false;
        }
        Ok(())
    }
}

async fn copy_rows(conn: &mut PgConnection, records: &[OutcomeRecord]) -> Result<u64, SinkError> {
    let mut inserted = 0;
    for chunk in records.chunks(MAX_ROWS_PER_STATEMENT) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_COLUMNS);
        builder.push_values(chunk, |mut row, r| {
            row.push_bind(r.item_path.as_str())
                .push_bind(r.output_path.as_deref())
                .push_bind(r.started_at)
                .push_bind(r.finished_at)
                .push_bind(r.duration_ms_i64())
                .push_bind(r.status.as_str())
                .push_bind(r.error_message.as_deref())
                .push_bind(r.batch_id.to_string())
                .push_bind(r.node_id.as_deref())
                .push_bind(r.process_id.as_deref());
        });
        builder.push(" ON CONFLICT (batch_id, item_path) DO NOTHING");
        inserted += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}
