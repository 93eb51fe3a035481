//! Outcome persistence -- the local SQLite sink and the remote PostgreSQL store.

pub mod local;
pub mod remote;
pub mod schema;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::OutcomeRecord;

pub use local::{LocalSink, StoredRecord};
pub use remote::{PgRemoteStore, RemoteSession, RemoteStore};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("blocking storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("stored row {id} is invalid: {reason}")]
    CorruptRow { id: i64, reason: String },
}

/// A store that outcome records can be appended to.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Create the outcome table if absent. Safe to call on every start.
    async fn ensure_schema(&self) -> Result<(), SinkError>;

    /// Insert all `records` as one unit. Returns the number of new rows;
    /// rows already present under the same `(batch_id, item_path)` are skipped.
    async fn bulk_insert(&self, records: &[OutcomeRecord]) -> Result<usize, SinkError>;
}
