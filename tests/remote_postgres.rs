//! Runs against a live PostgreSQL when `DATABASE_URL` is set; skipped otherwise.

use std::time::Duration;

use chrono::Utc;
use docbatch::record::{OutcomeRecord, RunContext};
use docbatch::storage::{OutcomeSink, PgRemoteStore, RemoteStore};
use docbatch::sync::direct_sync;
use sqlx::postgres::PgPoolOptions;

async fn store(max_connections: u32) -> Option<PgRemoteStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("DATABASE_URL not set - skipping PostgreSQL test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
        .expect("failed to connect to DATABASE_URL");
    let store = PgRemoteStore::from_pool(pool);
    RemoteStore::ensure_schema(&store).await.unwrap();
    Some(store)
}

fn records(run: &RunContext, n: usize) -> Vec<OutcomeRecord> {
    (0..n)
        .map(|i| {
            OutcomeRecord::complete(
                run,
                format!("/in/{}.pdf", i),
                Utc::now(),
                Duration::from_millis(3),
                Ok(format!("/out/{}.pdf", i)),
            )
        })
        .collect()
}

async fn stored_rows(store: &PgRemoteStore, run: &RunContext) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM outcome_records WHERE batch_id = $1")
        .bind(run.batch_id.to_string())
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_session_keeps_one_connection_across_checkpoints() {
    let Some(store) = store(1).await else { return };
    let run = RunContext::new(Some("pg-test".into()), None);
    let recs = records(&run, 4);

    let mut session = store.session().await.unwrap();
    session.insert(&recs[0]).await.unwrap();
    session.insert(&recs[1]).await.unwrap();
    session.commit().await.unwrap();
    // The only pooled connection stays with the session between checkpoints.
    assert!(store.pool().try_acquire().is_none());
    session.insert(&recs[2]).await.unwrap();
    session.insert(&recs[3]).await.unwrap();
    session.commit().await.unwrap();
    assert!(store.pool().try_acquire().is_none());
    drop(session);
    assert_eq!(stored_rows(&store, &run).await, 4);
}

#[tokio::test]
async fn test_rollback_discards_uncommitted_rows() {
    let Some(store) = store(2).await else { return };
    let run = RunContext::new(None, None);
    let recs = records(&run, 3);

    let mut session = store.session().await.unwrap();
    session.insert(&recs[0]).await.unwrap();
    session.commit().await.unwrap();
    session.copy_page(&recs[1..]).await.unwrap();
    session.rollback().await.unwrap();
    drop(session);

    assert_eq!(stored_rows(&store, &run).await, 1);
}

#[tokio::test]
async fn test_direct_sync_and_bulk_insert_are_idempotent() {
    let Some(store) = store(2).await else { return };
    let run = RunContext::new(None, None);
    let recs = records(&run, 5);

    let report = direct_sync(&store, &recs, 2).await.unwrap();
    assert_eq!(report.commits, 3);
    assert_eq!(report.inserted, 5);

    assert_eq!(store.bulk_insert(&recs).await.unwrap(), 0);
    let more = records(&RunContext::new(None, None), 2);
    assert_eq!(store.bulk_insert(&more).await.unwrap(), 2);
    assert_eq!(stored_rows(&store, &run).await, 5);
}
