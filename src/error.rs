//! Run-level error taxonomy.
//!
//! Only the variants here abort a run. Per-item transform failures never
//! surface as errors; they are captured in the item's outcome record.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::SinkError;
use crate::transform::TransformError;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("discovery of {root} failed: {source}")]
    Discovery {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// Item paths are stored as text, so a name that is not valid UTF-8
    /// cannot be given a distinct identity.
    #[error("item path is not valid UTF-8: {}", .path.display())]
    NonUtf8Path { path: PathBuf },

    #[error("failed to prepare output root {path}: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load shared transform resource: {0}")]
    TransformSetup(#[from] TransformError),

    #[error("local sink setup failed: {0}")]
    LocalSetup(#[source] SinkError),
}
