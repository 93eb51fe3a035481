//! Outcome records and run identity.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal status of one processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "SUCCESS",
            OutcomeStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(OutcomeStatus::Success),
            "FAILED" => Ok(OutcomeStatus::Failed),
            other => Err(format!("unknown outcome status '{}'", other)),
        }
    }
}

/// Identity of one execution. Stamped on every record the run produces.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub batch_id: Uuid,
    pub node_id: Option<String>,
    pub process_id: Option<String>,
    pub total_items: usize,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    /// Start a new run with a freshly generated batch id.
    pub fn new(node_id: Option<String>, process_id: Option<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            node_id,
            process_id,
            total_items: 0,
            started_at: Utc::now(),
        }
    }

    /// Start a run identified by this host and OS process, unless overridden.
    pub fn for_host(node_id: Option<String>, process_id: Option<String>) -> Self {
        let node_id = node_id.or_else(sysinfo::System::host_name);
        let process_id = process_id.or_else(|| Some(std::process::id().to_string()));
        Self::new(node_id, process_id)
    }

    pub fn with_total_items(mut self, total_items: usize) -> Self {
        self.total_items = total_items;
        self
    }
}

/// The result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub item_path: String,
    pub output_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: OutcomeStatus,
    pub error_message: Option<String>,
    pub batch_id: Uuid,
    pub node_id: Option<String>,
    pub process_id: Option<String>,
}

impl OutcomeRecord {
    /// Build the record for an item whose processing has terminated.
    ///
    /// `finished_at` is derived from the monotonic `elapsed` so it can never
    /// precede `started_at`, even if the wall clock steps backwards mid-item.
    pub fn complete(
        run: &RunContext,
        item_path: impl Into<String>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        outcome: Result<String, String>,
    ) -> Self {
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let finished_at = chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(started_at);

        let (status, output_path, error_message) = match outcome {
            Ok(output) => (OutcomeStatus::Success, Some(output), None),
            Err(message) => (OutcomeStatus::Failed, None, Some(message)),
        };

        Self {
            item_path: item_path.into(),
            output_path,
            started_at,
            finished_at,
            duration_ms,
            status,
            error_message,
            batch_id: run.batch_id,
            node_id: run.node_id.clone(),
            process_id: run.process_id.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Append a secondary note without touching the status.
    pub fn annotate(&mut self, note: impl AsRef<str>) {
        let note = note.as_ref();
        self.error_message = Some(match self.error_message.take() {
            Some(existing) => format!("{}; {}", existing, note),
            None => note.to_string(),
        });
    }

    /// `duration_ms` as the signed integer both stores persist.
    pub fn duration_ms_i64(&self) -> i64 {
        i64::try_from(self.duration_ms).unwrap_or(i64::MAX)
    }
}
