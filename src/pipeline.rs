//! One run end to end: discover, execute, flush locally, sync remotely.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery;
use crate::error::BatchError;
use crate::executor::{BatchExecutor, ExecutorOptions, SourceCleanup};
use crate::progress::{ProgressAggregator, ProgressSummary};
use crate::record::{OutcomeRecord, RunContext};
use crate::storage::{LocalSink, OutcomeSink, PgRemoteStore, RemoteStore, SinkError};
use crate::sync::{self, SyncReport};
use crate::transform::{AppendTransformer, Transformer};

/// Everything a run produced. Persistence failures are reported here rather
/// than failing the run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub batch_id: Uuid,
    pub summary: ProgressSummary,
    #[serde(skip)]
    pub records: Vec<OutcomeRecord>,
    pub local_inserted: Option<usize>,
    pub local_error: Option<String>,
    pub remote: Option<SyncReport>,
    pub remote_error: Option<String>,
}

pub struct Pipeline {
    config: Config,
    transformer: Arc<dyn Transformer>,
    cleanup: Option<Arc<dyn SourceCleanup>>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl Pipeline {
    pub fn new(config: Config, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            config,
            transformer,
            cleanup: None,
            remote: None,
        }
    }

    /// Pipeline using the built-in [`AppendTransformer`].
    pub fn from_config(config: Config) -> Result<Self, BatchError> {
        let transformer = AppendTransformer::load(
            &config.source_root,
            &config.output_root,
            config.transform.appendix_path.as_deref(),
        )?;
        Ok(Self::new(config, Arc::new(transformer)))
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn SourceCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Use `remote` instead of connecting to `remote_sync.connection_string`.
    pub fn with_remote_store(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Execute one run. Only discovery and setup failures are errors; item,
    /// local flush and remote sync failures land in the report.
    pub async fn run(&self) -> Result<RunReport, BatchError> {
        let cfg = &self.config;

        // 1. Run identity
        let run = RunContext::for_host(cfg.node_id.clone(), cfg.process_id.clone());
        info!(batch_id = %run.batch_id, node_id = ?run.node_id, "starting run");

        // 2. Discovery
        let items = discovery::discover(&cfg.source_root, &cfg.extensions)?;
        let run = run.with_total_items(items.len());
        let progress = Arc::new(ProgressAggregator::new(items.len()));

        if items.is_empty() {
            info!(root = %cfg.source_root.display(), "nothing to process");
            return Ok(RunReport {
                batch_id: run.batch_id,
                summary: progress.summary(),
                records: Vec::new(),
                local_inserted: None,
                local_error: None,
                remote: None,
                remote_error: None,
            });
        }

        std::fs::create_dir_all(&cfg.output_root).map_err(|source| BatchError::OutputRoot {
            path: cfg.output_root.clone(),
            source,
        })?;

        // 3. Local sink schema, before any work is done
        let local = if cfg.local_sink.enabled {
            let sink = LocalSink::open(&cfg.local_sink.location).map_err(BatchError::LocalSetup)?;
            sink.ensure_schema().await.map_err(BatchError::LocalSetup)?;
            Some(sink)
        } else {
            None
        };

        // 4. Process
        let mut executor = BatchExecutor::new(
            Arc::clone(&self.transformer),
            ExecutorOptions {
                concurrency: cfg.concurrency,
                delete_source_on_success: cfg.delete_source_on_success,
            },
        );
        if let Some(cleanup) = &self.cleanup {
            executor = executor.with_cleanup(Arc::clone(cleanup));
        }
        let records = executor.execute(items, &run, Arc::clone(&progress)).await;

        let mut report = RunReport {
            batch_id: run.batch_id,
            summary: progress.summary(),
            records,
            local_inserted: None,
            local_error: None,
            remote: None,
            remote_error: None,
        };

        // 5. Local flush
        if let Some(sink) = &local {
            match sink.bulk_insert(&report.records).await {
                Ok(n) => {
                    if n < report.records.len() {
                        warn!(
                            path = %sink.location().display(),
                            records = report.records.len(),
                            inserted = n,
                            "local sink skipped records already keyed under this batch"
                        );
                    }
                    report.local_inserted = Some(n);
                }
                Err(e) => {
                    error!(path = %sink.location().display(), "local flush failed: {}", e);
                    report.local_error = Some(e.to_string());
                }
            }
        }

        // 6. Remote sync of this run's records
        if cfg.remote_sync.enabled {
            match self.sync_direct(&report.records).await {
                Ok(sync_report) => report.remote = Some(sync_report),
                Err(e) => {
                    warn!("remote sync failed: {:#}", e);
                    report.remote_error = Some(format!("{:#}", e));
                }
            }
        }

        Ok(report)
    }

    async fn sync_direct(&self, records: &[OutcomeRecord]) -> Result<SyncReport> {
        let remote = self.remote_store().await?;
        remote
            .ensure_schema()
            .await
            .context("failed to prepare remote schema")?;
        Ok(sync::direct_sync(remote.as_ref(), records, self.config.remote_sync.commit_every).await?)
    }

    async fn remote_store(&self) -> Result<Arc<dyn RemoteStore>> {
        if let Some(remote) = &self.remote {
            return Ok(Arc::clone(remote));
        }
        connect_remote(&self.config).await
    }
}

async fn connect_remote(config: &Config) -> Result<Arc<dyn RemoteStore>> {
    let url = config
        .remote_sync
        .connection_string
        .as_deref()
        .context("remote_sync.connection_string is not set")?;
    let store = PgRemoteStore::connect(url, config.remote_sync.max_connections)
        .await
        .context("failed to connect to remote store")?;
    Ok(Arc::new(store))
}

/// Copy everything in the local sink into the remote store.
pub async fn catch_up(config: &Config) -> Result<SyncReport> {
    let local = LocalSink::open(&config.local_sink.location)
        .with_context(|| format!("failed to open {}", config.local_sink.location.display()))?;
    let remote = connect_remote(config).await?;
    catch_up_with(&local, remote.as_ref(), config.remote_sync.page_size).await
}

pub async fn catch_up_with(
    local: &LocalSink,
    remote: &dyn RemoteStore,
    page_size: usize,
) -> Result<SyncReport> {
    local
        .ensure_schema()
        .await
        .context("failed to prepare local schema")?;
    remote
        .ensure_schema()
        .await
        .context("failed to prepare remote schema")?;
    Ok(sync::catch_up_sync(local, remote, page_size).await?)
}

/// Create the local outcome table.
pub async fn init_local(config: &Config) -> Result<(), SinkError> {
    let sink = LocalSink::open(&config.local_sink.location)?;
    sink.ensure_schema().await
}
