//! Replication of outcome records into the remote store.
//!
//! Two modes share the same remote session seam:
//!
//! * **direct** -- the records of the current run are inserted one by one,
//!   with a checkpoint commit every `commit_every` rows and a final commit for
//!   the remainder. A dropped connection loses at most `commit_every - 1`
//!   uncommitted rows, which a later catch-up pass re-sends.
//! * **catch-up** -- every row of the local sink is read in pages and copied
//!   in bulk, one commit per page. A failure leaves a committed prefix.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::OutcomeRecord;
use crate::storage::{LocalSink, RemoteSession, RemoteStore, SinkError};

pub const DEFAULT_COMMIT_EVERY: usize = 500;
pub const DEFAULT_PAGE_SIZE: usize = 5000;

/// What a sync attempt committed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Rows sent and committed.
    pub rows: u64,
    /// Rows the remote store did not already hold.
    pub inserted: u64,
    /// Commits issued.
    pub commits: u64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote sync interrupted after {} committed rows: {source}", .committed.rows)]
    Remote {
        committed: SyncReport,
        #[source]
        source: SinkError,
    },

    #[error("reading local sink failed after {} committed rows: {source}", .committed.rows)]
    Local {
        committed: SyncReport,
        #[source]
        source: SinkError,
    },
}

impl SyncError {
    /// Work that was durably committed before the failure.
    pub fn committed(&self) -> SyncReport {
        match self {
            SyncError::Remote { committed, .. } | SyncError::Local { committed, .. } => *committed,
        }
    }
}

/// Roll back the in-flight transaction and wrap the underlying error.
async fn abort(session: &mut dyn RemoteSession, committed: SyncReport, source: SinkError) -> SyncError {
    if let Err(e) = session.rollback().await {
        warn!("rollback after failed sync also failed: {}", e);
    }
    warn!(committed_rows = committed.rows, "remote sync aborted: {}", source);
    SyncError::Remote { committed, source }
}

/// Insert `records` one at a time, committing every `commit_every` rows.
pub async fn direct_sync(
    store: &dyn RemoteStore,
    records: &[OutcomeRecord],
    commit_every: usize,
) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();
    if records.is_empty() {
        return Ok(report);
    }
    let commit_every = commit_every.max(1);

    let mut session = store
        .session()
        .await
        .map_err(|source| SyncError::Remote { committed: report, source })?;

    let mut pending_rows = 0u64;
    let mut pending_inserted = 0u64;

    for record in records {
        match session.insert(record).await {
            Ok(n) => pending_inserted += n,
            Err(e) => return Err(abort(session.as_mut(), report, e).await),
        }
        pending_rows += 1;

        if pending_rows as usize == commit_every {
            if let Err(e) = session.commit().await {
                return Err(abort(session.as_mut(), report, e).await);
            }
            report.rows += pending_rows;
            report.inserted += pending_inserted;
            report.commits += 1;
            pending_rows = 0;
            pending_inserted = 0;
            debug!(rows = report.rows, "checkpoint committed");
        }
    }

    if pending_rows > 0 {
        if let Err(e) = session.commit().await {
            return Err(abort(session.as_mut(), report, e).await);
        }
        report.rows += pending_rows;
        report.inserted += pending_inserted;
        report.commits += 1;
    }

    info!(
        rows = report.rows,
        inserted = report.inserted,
        commits = report.commits,
        "direct sync complete"
    );
    Ok(report)
}

/// Copy every row of the local sink into the remote store, `page_size` rows
/// per transaction.
pub async fn catch_up_sync(
    local: &LocalSink,
    store: &dyn RemoteStore,
    page_size: usize,
) -> Result<SyncReport, SyncError> {
    let page_size = page_size.max(1);
    let mut report = SyncReport::default();
    let mut session = store
        .session()
        .await
        .map_err(|source| SyncError::Remote { committed: report, source })?;
    let mut after_id = 0i64;

    loop {
        let page = local
            .fetch_page(after_id, page_size)
            .await
            .map_err(|source| SyncError::Local { committed: report, source })?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.id;
        let full_page = page.len() == page_size;
        let records: Vec<OutcomeRecord> = page.into_iter().map(|stored| stored.record).collect();

        let inserted = match session.copy_page(&records).await {
            Ok(n) => n,
            Err(e) => return Err(abort(session.as_mut(), report, e).await),
        };
        if let Err(e) = session.commit().await {
            return Err(abort(session.as_mut(), report, e).await);
        }

        report.rows += records.len() as u64;
        report.inserted += inserted;
        report.commits += 1;
        info!(
            page = report.commits,
            rows = report.rows,
            last_id = after_id,
            "catch-up page committed"
        );

        if !full_page {
            break;
        }
    }

    info!(
        rows = report.rows,
        inserted = report.inserted,
        pages = report.commits,
        "catch-up sync complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RunContext;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryState {
        committed: Vec<OutcomeRecord>,
        keys: HashSet<(String, String)>,
        commits: usize,
        rollbacks: usize,
        inserts_seen: usize,
        fail_on_insert: Option<usize>,
        copies_seen: usize,
        fail_on_copy: Option<usize>,
    }

    /// In-memory remote store honouring the `(batch_id, item_path)` key.
    #[derive(Clone, Default)]
    struct MemoryRemote {
        state: Arc<Mutex<MemoryState>>,
    }

    impl MemoryRemote {
        fn failing_on_insert(n: usize) -> Self {
            let remote = Self::default();
            remote.state.lock().unwrap().fail_on_insert = Some(n);
            remote
        }

        fn failing_on_copy(n: usize) -> Self {
            let remote = Self::default();
            remote.state.lock().unwrap().fail_on_copy = Some(n);
            remote
        }

        fn committed_len(&self) -> usize {
            self.state.lock().unwrap().committed.len()
        }

        fn commits(&self) -> usize {
            self.state.lock().unwrap().commits
        }
    }

    struct MemorySession {
        state: Arc<Mutex<MemoryState>>,
        pending: Vec<OutcomeRecord>,
    }

    impl MemorySession {
        fn stage(&mut self, record: &OutcomeRecord) -> Result<u64, SinkError> {
            let state = self.state.lock().unwrap();
            let key = (record.batch_id.to_string(), record.item_path.clone());
            let staged = self
                .pending
                .iter()
                .any(|p| p.batch_id == record.batch_id && p.item_path == record.item_path);
            if state.keys.contains(&key) || staged {
                return Ok(0);
            }
            drop(state);
            self.pending.push(record.clone());
            Ok(1)
        }
    }

    #[async_trait]
    impl RemoteSession for MemorySession {
        async fn insert(&mut self, record: &OutcomeRecord) -> Result<u64, SinkError> {
            {
                let mut state = self.state.lock().unwrap();
                state.inserts_seen += 1;
                if state.fail_on_insert == Some(state.inserts_seen) {
                    return Err(SinkError::CorruptRow {
                        id: state.inserts_seen as i64,
                        reason: "connection reset".into(),
                    });
                }
            }
            self.stage(record)
        }

        async fn copy_page(&mut self, records: &[OutcomeRecord]) -> Result<u64, SinkError> {
            {
                let mut state = self.state.lock().unwrap();
                state.copies_seen += 1;
                if state.fail_on_copy == Some(state.copies_seen) {
                    return Err(SinkError::CorruptRow {
                        id: state.copies_seen as i64,
                        reason: "connection reset".into(),
                    });
                }
            }
            let mut inserted = 0;
            for r in records {
                inserted += self.stage(r)?;
            }
            Ok(inserted)
        }

        async fn commit(&mut self) -> Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            for r in self.pending.drain(..) {
                state.keys.insert((r.batch_id.to_string(), r.item_path.clone()));
                state.committed.push(r);
            }
            state.commits += 1;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), SinkError> {
            self.pending.clear();
            self.state.lock().unwrap().rollbacks += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn ensure_schema(&self) -> Result<(), SinkError> {
            Ok(())
        }

        async fn session(&self) -> Result<Box<dyn RemoteSession>, SinkError> {
            Ok(Box::new(MemorySession {
                state: Arc::clone(&self.state),
                pending: Vec::new(),
            }))
        }
    }

    fn records(run: &RunContext, n: usize) -> Vec<OutcomeRecord> {
        (0..n)
            .map(|i| {
                OutcomeRecord::complete(
                    run,
                    format!("/in/{}.pdf", i),
                    Utc::now(),
                    Duration::from_millis(5),
                    Ok(format!("/out/{}.pdf", i)),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_direct_sync_checkpoints_every_n_rows() {
        let remote = MemoryRemote::default();
        let recs = records(&RunContext::new(None, None), 5);

        let report = direct_sync(&remote, &recs, 2).await.unwrap();

        // after record 2, after record 4, final after record 5
        assert_eq!(report.commits, 3);
        assert_eq!(remote.commits(), 3);
        assert_eq!(report.rows, 5);
        assert_eq!(report.inserted, 5);
        assert_eq!(remote.committed_len(), 5);
    }

    #[tokio::test]
    async fn test_direct_sync_exact_multiple_has_no_empty_final_commit() {
        let remote = MemoryRemote::default();
        let recs = records(&RunContext::new(None, None), 4);

        let report = direct_sync(&remote, &recs, 2).await.unwrap();
        assert_eq!(report.commits, 2);
    }

    #[tokio::test]
    async fn test_direct_sync_empty_is_noop() {
        let remote = MemoryRemote::default();
        let report = direct_sync(&remote, &[], DEFAULT_COMMIT_EVERY).await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(remote.commits(), 0);
    }

    #[tokio::test]
    async fn test_direct_sync_failure_keeps_committed_checkpoints() {
        // Fifth insert fails: rows 1-4 are committed in two checkpoints.
        let remote = MemoryRemote::failing_on_insert(5);
        let recs = records(&RunContext::new(None, None), 6);

        let err = direct_sync(&remote, &recs, 2).await.unwrap_err();

        assert!(matches!(err, SyncError::Remote { .. }));
        assert_eq!(err.committed().rows, 4);
        assert_eq!(remote.committed_len(), 4);
        assert_eq!(remote.state.lock().unwrap().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_direct_sync_replay_is_idempotent() {
        let remote = MemoryRemote::default();
        let recs = records(&RunContext::new(None, None), 3);

        direct_sync(&remote, &recs, 10).await.unwrap();
        let replay = direct_sync(&remote, &recs, 10).await.unwrap();

        assert_eq!(replay.rows, 3);
        assert_eq!(replay.inserted, 0);
        assert_eq!(remote.committed_len(), 3);
    }

    fn local_with(dir: &tempfile::TempDir, n: usize) -> LocalSink {
        let local = LocalSink::open(dir.path().join("outcomes.sqlite")).unwrap();
        local.migrate().unwrap();
        local.insert_all(&records(&RunContext::new(None, None), n)).unwrap();
        local
    }

    #[tokio::test]
    async fn test_catch_up_commits_per_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = local_with(&dir, 7);
        let remote = MemoryRemote::default();

        let report = catch_up_sync(&local, &remote, 3).await.unwrap();

        assert_eq!(report.rows, 7);
        assert_eq!(report.commits, 3);
        assert_eq!(remote.committed_len(), 7);
    }

    #[tokio::test]
    async fn test_catch_up_failure_keeps_committed_pages() {
        // Pages of 3 over 7 rows; the second page fails to copy.
        let dir = tempfile::TempDir::new().unwrap();
        let local = local_with(&dir, 7);
        let remote = MemoryRemote::failing_on_copy(2);

        let err = catch_up_sync(&local, &remote, 3).await.unwrap_err();

        assert!(matches!(err, SyncError::Remote { .. }));
        assert_eq!(err.committed().rows, 3);
        assert_eq!(err.committed().commits, 1);
        assert_eq!(remote.committed_len(), 3);
        assert_eq!(remote.state.lock().unwrap().rollbacks, 1);

        // A later pass re-sends everything and only the missing rows land.
        let retry = catch_up_sync(&local, &remote, 3).await.unwrap();
        assert_eq!(retry.rows, 7);
        assert_eq!(retry.inserted, 4);
        assert_eq!(remote.committed_len(), 7);
    }

    #[tokio::test]
    async fn test_catch_up_rerun_does_not_error_or_duplicate() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = local_with(&dir, 5);
        let remote = MemoryRemote::default();

        catch_up_sync(&local, &remote, 2).await.unwrap();
        let second = catch_up_sync(&local, &remote, 2).await.unwrap();

        assert_eq!(second.rows, 5);
        assert_eq!(second.inserted, 0);
        assert_eq!(remote.committed_len(), 5);
    }

    #[tokio::test]
    async fn test_catch_up_on_empty_local_sink() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = local_with(&dir, 0);
        let remote = MemoryRemote::default();

        let report = catch_up_sync(&local, &remote, DEFAULT_PAGE_SIZE).await.unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[tokio::test]
    async fn test_catch_up_page_size_equal_to_rows_stops_on_empty_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let local = local_with(&dir, 4);
        let remote = MemoryRemote::default();

        let report = catch_up_sync(&local, &remote, 4).await.unwrap();
        assert_eq!(report.rows, 4);
        assert_eq!(report.commits, 1);
    }
}
