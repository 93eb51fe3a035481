//! Append-only SQLite sink for outcome records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::{debug, info};
use uuid::Uuid;

use super::{schema, OutcomeSink, SinkError};
use crate::record::{OutcomeRecord, OutcomeStatus};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// A record read back from the local sink, with its surrogate key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub record: OutcomeRecord,
}

/// Local durable store. Records are only ever appended.
#[derive(Clone)]
pub struct LocalSink {
    pool: Pool,
    location: PathBuf,
}

/// Open (or create) the SQLite database file and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool, SinkError> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });
    Ok(R2D2Pool::new(manager)?)
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(id: i64, raw: &str) -> Result<DateTime<Utc>, SinkError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SinkError::CorruptRow {
            id,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

struct RawRow {
    id: i64,
    item_path: String,
    output_path: Option<String>,
    started_at: String,
    finished_at: String,
    duration_ms: i64,
    status: String,
    error_message: Option<String>,
    batch_id: String,
    node_id: Option<String>,
    process_id: Option<String>,
}

impl RawRow {
    fn into_stored(self) -> Result<StoredRecord, SinkError> {
        let id = self.id;
        let corrupt = |reason: String| SinkError::CorruptRow { id, reason };

        let status = self.status.parse::<OutcomeStatus>().map_err(corrupt)?;
        let batch_id = Uuid::parse_str(&self.batch_id)
            .map_err(|e| corrupt(format!("bad batch_id '{}': {}", self.batch_id, e)))?;
        let duration_ms = u64::try_from(self.duration_ms)
            .map_err(|_| corrupt(format!("negative duration_ms {}", self.duration_ms)))?;

        Ok(StoredRecord {
            id,
            record: OutcomeRecord {
                item_path: self.item_path,
                output_path: self.output_path,
                started_at: parse_ts(id, &self.started_at)?,
                finished_at: parse_ts(id, &self.finished_at)?,
                duration_ms,
                status,
                error_message: self.error_message,
                batch_id,
                node_id: self.node_id,
                process_id: self.process_id,
            },
        })
    }
}

impl LocalSink {
    /// Open the sink at `path`. The schema is not touched until
    /// [`LocalSink::migrate`] or [`OutcomeSink::ensure_schema`] runs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let location = path.as_ref().to_path_buf();
        let pool = open_pool(&location)?;
        debug!(path = %location.display(), "opened local sink");
        Ok(Self { pool, location })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn migrate(&self) -> Result<(), SinkError> {
        let conn = self.pool.get()?;
        schema::migrate(&conn)?;
        Ok(())
    }

    /// Insert every record inside one transaction. Nothing is written unless
    /// every statement succeeds.
    pub fn insert_all(&self, records: &[OutcomeRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO outcome_records
                 (item_path, output_path, started_at, finished_at, duration_ms,
                  status, error_message, batch_id, node_id, process_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for r in records {
                inserted += stmt.execute(params![
                    r.item_path,
                    r.output_path,
                    format_ts(&r.started_at),
                    format_ts(&r.finished_at),
                    r.duration_ms_i64(),
                    r.status.as_str(),
                    r.error_message,
                    r.batch_id.to_string(),
                    r.node_id,
                    r.process_id,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            path = %self.location.display(),
            records = records.len(),
            inserted,
            "flushed outcome records"
        );
        Ok(inserted)
    }

    /// Up to `limit` records with `id > after_id`, in id order.
    pub fn read_page(&self, after_id: i64, limit: usize) -> Result<Vec<StoredRecord>, SinkError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, item_path, output_path, started_at, finished_at, duration_ms,
                    status, error_message, batch_id, node_id, process_id
             FROM outcome_records
             WHERE id > ?1
             ORDER BY id
             LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![after_id, limit], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                item_path: row.get(1)?,
                output_path: row.get(2)?,
                started_at: row.get(3)?,
                finished_at: row.get(4)?,
                duration_ms: row.get(5)?,
                status: row.get(6)?,
                error_message: row.get(7)?,
                batch_id: row.get(8)?,
                node_id: row.get(9)?,
                process_id: row.get(10)?,
            })
        })?;

        let mut page = Vec::new();
        for raw in rows {
            page.push(raw?.into_stored()?);
        }
        Ok(page)
    }

    /// [`LocalSink::read_page`] on the blocking thread pool.
    pub async fn fetch_page(&self, after_id: i64, limit: usize) -> Result<Vec<StoredRecord>, SinkError> {
        self.off_runtime(move |sink| sink.read_page(after_id, limit)).await
    }

    /// Run rusqlite work on a blocking thread so async callers never stall
    /// a runtime worker.
    async fn off_runtime<T, F>(&self, work: F) -> Result<T, SinkError>
    where
        T: Send + 'static,
        F: FnOnce(&LocalSink) -> Result<T, SinkError> + Send + 'static,
    {
        let sink = self.clone();
        tokio::task::spawn_blocking(move || work(&sink)).await?
    }

    pub fn count(&self) -> Result<u64, SinkError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outcome_records", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn count_for_batch(&self, batch_id: Uuid) -> Result<u64, SinkError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outcome_records WHERE batch_id = ?1",
            params![batch_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl OutcomeSink for LocalSink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        self.off_runtime(|sink| sink.migrate()).await
    }

    async fn bulk_insert(&self, records: &[OutcomeRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let records = records.to_vec();
        self.off_runtime(move |sink| sink.insert_all(&records)).await
    }
}
