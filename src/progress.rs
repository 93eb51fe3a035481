//! Thread-safe progress counters with ETA estimation.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::record::OutcomeStatus;

struct ProgressState {
    processed: usize,
    successful: usize,
    failed: usize,
    cumulative_duration_ms: u64,
}

/// Aggregates completions reported by concurrent workers.
///
/// All counters sit behind one mutex that is held only for the counter update
/// and the progress line.
pub struct ProgressAggregator {
    total: usize,
    started: Instant,
    state: Mutex<ProgressState>,
}

/// Snapshot returned by [`ProgressAggregator::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub processed: usize,
    pub total: usize,
    pub percent: f64,
    pub elapsed: Duration,
    pub eta: Duration,
}

/// Final run statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub total_files: usize,
    pub processed_files: usize,
    pub successful: usize,
    pub failed: usize,
    pub elapsed_seconds: f64,
    pub avg_ms_per_file: f64,
}

impl ProgressAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            started: Instant::now(),
            state: Mutex::new(ProgressState {
                processed: 0,
                successful: 0,
                failed: 0,
                cumulative_duration_ms: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        // Counters stay consistent even if a holder panicked mid-log.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one completed item and emit a progress line.
    pub fn update(&self, status: OutcomeStatus, duration_ms: u64) -> ProgressTick {
        let mut state = self.lock();

        state.processed += 1;
        match status {
            OutcomeStatus::Success => state.successful += 1,
            OutcomeStatus::Failed => state.failed += 1,
        }
        state.cumulative_duration_ms = state.cumulative_duration_ms.saturating_add(duration_ms);

        let elapsed = self.started.elapsed();
        let avg_per_item = elapsed.as_secs_f64() / state.processed as f64;
        let remaining = self.total.saturating_sub(state.processed);
        let eta = Duration::from_secs_f64(remaining as f64 * avg_per_item);
        let percent = percent_of(state.processed, self.total);

        info!(
            processed = state.processed,
            total = self.total,
            "[{}/{}] {:.1}% | elapsed: {} | ETA: {}",
            state.processed,
            self.total,
            percent,
            format_duration(elapsed.as_secs_f64()),
            format_duration(eta.as_secs_f64()),
        );

        ProgressTick {
            processed: state.processed,
            total: self.total,
            percent,
            elapsed,
            eta,
        }
    }

    /// Snapshot of the counters. Meaningful once every worker has reported.
    pub fn summary(&self) -> ProgressSummary {
        let state = self.lock();
        let avg_ms_per_file = if state.processed > 0 {
            state.cumulative_duration_ms as f64 / state.processed as f64
        } else {
            0.0
        };

        ProgressSummary {
            total_files: self.total,
            processed_files: state.processed,
            successful: state.successful,
            failed: state.failed,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            avg_ms_per_file,
        }
    }
}

fn percent_of(processed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        processed as f64 / total as f64 * 100.0
    }
}

/// Render seconds as `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(seconds: f64) -> String {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let (m, s) = (seconds / 60, seconds % 60);
    let (h, m) = (m / 60, m % 60);

    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
