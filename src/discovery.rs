//! Recursive discovery of source documents.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::BatchError;

/// Walk `root` and return every regular file whose extension matches one of
/// `extensions` (case-insensitive). An empty `extensions` list accepts all
/// files.
///
/// Any traversal error, including a missing root or an unreadable subtree,
/// aborts discovery. So does a matching file whose path is not valid UTF-8.
pub fn discover(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, BatchError> {
    let mut items = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|source| BatchError::Discovery {
            root: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !matches_extension(entry.path(), extensions) {
            debug!(path = %entry.path().display(), "skipping non-matching file");
            continue;
        }
        if entry.path().to_str().is_none() {
            return Err(BatchError::NonUtf8Path {
                path: entry.into_path(),
            });
        }
        items.push(entry.into_path());
    }

    // Stable order keeps logs and reruns comparable.
    items.sort();
    info!(root = %root.display(), count = items.len(), "discovery complete");
    Ok(items)
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => extensions
            .iter()
            .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext)),
        None => false,
    }
}
