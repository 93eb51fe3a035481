//! Bounded-concurrency batch executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::progress::ProgressAggregator;
use crate::record::{OutcomeRecord, RunContext};
use crate::transform::Transformer;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Post-success side effect on the source item.
pub trait SourceCleanup: Send + Sync {
    fn remove(&self, item: &Path) -> std::io::Result<()>;
}

/// Deletes the source file.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveSource;

impl SourceCleanup for RemoveSource {
    fn remove(&self, item: &Path) -> std::io::Result<()> {
        std::fs::remove_file(item)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    pub concurrency: usize,
    pub delete_source_on_success: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            delete_source_on_success: false,
        }
    }
}

/// Runs the transformer over every item on a fixed-size worker pool.
pub struct BatchExecutor {
    transformer: Arc<dyn Transformer>,
    cleanup: Arc<dyn SourceCleanup>,
    options: ExecutorOptions,
}

impl BatchExecutor {
    pub fn new(transformer: Arc<dyn Transformer>, options: ExecutorOptions) -> Self {
        Self {
            transformer,
            cleanup: Arc::new(RemoveSource),
            options,
        }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn SourceCleanup>) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Process every item and return one record per item, in completion
    /// order. At most `concurrency` items are in flight at once.
    pub async fn execute(
        &self,
        items: Vec<PathBuf>,
        run: &RunContext,
        progress: Arc<ProgressAggregator>,
    ) -> Vec<OutcomeRecord> {
        let concurrency = self.options.concurrency.max(1);
        let delete_source = self.options.delete_source_on_success;
        info!(
            batch_id = %run.batch_id,
            items = items.len(),
            concurrency,
            "starting batch"
        );

        let tasks = items.into_iter().map(|item| {
            let transformer = Arc::clone(&self.transformer);
            let cleanup = Arc::clone(&self.cleanup);
            let progress = Arc::clone(&progress);
            let run = run.clone();

            async move {
                let item_path = item.display().to_string();
                let started_at = Utc::now();
                let clock = Instant::now();
                let worker_run = run.clone();

                let joined = tokio::task::spawn_blocking(move || {
                    process_item(
                        transformer.as_ref(),
                        cleanup.as_ref(),
                        delete_source,
                        &item,
                        &worker_run,
                    )
                })
                .await;

                let record = match joined {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(item = %item_path, "worker task aborted: {}", e);
                        OutcomeRecord::complete(
                            &run,
                            item_path,
                            started_at,
                            clock.elapsed(),
                            Err(format!("worker task aborted: {}", e)),
                        )
                    }
                };

                progress.update(record.status, record.duration_ms);
                record
            }
        });

        stream::iter(tasks)
            .buffer_unordered(concurrency)
            .collect()
            .await
    }
}

/// Transform one item and build its record. Never fails: a transform error
/// becomes a FAILED record and a cleanup error becomes a note.
pub fn process_item(
    transformer: &dyn Transformer,
    cleanup: &dyn SourceCleanup,
    delete_source: bool,
    item: &Path,
    run: &RunContext,
) -> OutcomeRecord {
    let started_at = Utc::now();
    let clock = Instant::now();

    let outcome = transformer
        .apply(item)
        .map(|artifact| artifact.display().to_string())
        .map_err(|e| e.to_string());
    let elapsed = clock.elapsed();

    let mut record = OutcomeRecord::complete(run, item.display().to_string(), started_at, elapsed, outcome);

    match &record.error_message {
        Some(err) => warn!(item = %record.item_path, error = %err, "transform failed"),
        None => debug!(item = %record.item_path, ms = record.duration_ms, "transform succeeded"),
    }

    if record.is_success() && delete_source {
        if let Err(e) = cleanup.remove(item) {
            warn!(item = %record.item_path, "source cleanup failed: {}", e);
            record.annotate(format!("source cleanup failed: {}", e));
        }
    }

    record
}
