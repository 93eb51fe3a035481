//! The per-item transformation seam and the built-in appending transformer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{item} is not under source root {root}")]
    OutsideSourceRoot { item: PathBuf, root: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

/// Produces one output artifact per item.
///
/// Implementations own whatever shared read-only resource they need. It is
/// loaded once before the worker pool starts and is read concurrently.
pub trait Transformer: Send + Sync {
    /// Transform `item` and return the path of the artifact written.
    fn apply(&self, item: &Path) -> Result<PathBuf, TransformError>;
}

/// Mirror `item` from `source_root` into `output_root`, preserving the
/// relative layout.
pub fn destination_for(
    item: &Path,
    source_root: &Path,
    output_root: &Path,
) -> Result<PathBuf, TransformError> {
    let relative = item
        .strip_prefix(source_root)
        .map_err(|_| TransformError::OutsideSourceRoot {
            item: item.to_path_buf(),
            root: source_root.to_path_buf(),
        })?;
    Ok(output_root.join(relative))
}

/// Writes each document followed by a fixed appendix (a stamp, a trailer
/// page, a license footer). With an empty appendix it is a mirror copy.
#[derive(Debug, Clone)]
pub struct AppendTransformer {
    source_root: PathBuf,
    output_root: PathBuf,
    appendix: Arc<Vec<u8>>,
}

impl AppendTransformer {
    pub fn new(source_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>, appendix: Vec<u8>) -> Self {
        Self {
            source_root: source_root.into(),
            output_root: output_root.into(),
            appendix: Arc::new(appendix),
        }
    }

    /// Load the appendix once from disk. A missing appendix file is fatal for
    /// the run, not per item.
    pub fn load(
        source_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        appendix_path: Option<&Path>,
    ) -> Result<Self, TransformError> {
        let appendix = match appendix_path {
            Some(path) => {
                let bytes = fs::read(path).map_err(|source| TransformError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!(path = %path.display(), bytes = bytes.len(), "loaded appendix");
                bytes
            }
            None => Vec::new(),
        };
        Ok(Self::new(source_root, output_root, appendix))
    }
}

impl Transformer for AppendTransformer {
    fn apply(&self, item: &Path) -> Result<PathBuf, TransformError> {
        let destination = destination_for(item, &self.source_root, &self.output_root)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| TransformError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut content = fs::read(item).map_err(|source| TransformError::Read {
            path: item.to_path_buf(),
            source,
        })?;
        content.extend_from_slice(&self.appendix);

        fs::write(&destination, &content).map_err(|source| TransformError::Write {
            path: destination.clone(),
            source,
        })?;
        debug!(item = %item.display(), output = %destination.display(), "transformed");
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_preserves_relative_layout() {
        let dest = destination_for(
            Path::new("/src/a/b/c.pdf"),
            Path::new("/src"),
            Path::new("/out"),
        )
        .unwrap();
        assert_eq!(dest, PathBuf::from("/out/a/b/c.pdf"));
    }

    #[test]
    fn test_destination_outside_root_is_rejected() {
        let err = destination_for(Path::new("/elsewhere/c.pdf"), Path::new("/src"), Path::new("/out"))
            .unwrap_err();
        assert!(matches!(err, TransformError::OutsideSourceRoot { .. }));
    }

    #[test]
    fn test_append_writes_content_and_creates_dirs() {
        let src = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("nested")).unwrap();
        let item = src.path().join("nested/doc.pdf");
        fs::write(&item, b"body").unwrap();

        let transformer = AppendTransformer::new(src.path(), out.path(), b"+stamp".to_vec());
        let artifact = transformer.apply(&item).unwrap();

        assert_eq!(artifact, out.path().join("nested/doc.pdf"));
        assert_eq!(fs::read(&artifact).unwrap(), b"body+stamp");
    }

    #[test]
    fn test_unreadable_item_fails() {
        let src = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let transformer = AppendTransformer::new(src.path(), out.path(), Vec::new());

        let err = transformer.apply(&src.path().join("gone.pdf")).unwrap_err();
        assert!(matches!(err, TransformError::Read { .. }));
    }

    #[test]
    fn test_load_missing_appendix_errors() {
        let result = AppendTransformer::load("/src", "/out", Some(Path::new("/nonexistent/appendix.pdf")));
        assert!(result.is_err());
    }
}
