//! docbatch -- bounded-concurrency document batch processing.
//!
//! This crate discovers documents under a source root, applies a
//! [`transform::Transformer`] to each one on a fixed worker pool, records one
//! [`record::OutcomeRecord`] per document, flushes the records to a local
//! SQLite store and optionally replicates them into a shared PostgreSQL store.

pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod storage;
pub mod sync;
pub mod transform;

pub use config::Config;
pub use error::BatchError;
pub use pipeline::{Pipeline, RunReport};
pub use record::{OutcomeRecord, OutcomeStatus, RunContext};
