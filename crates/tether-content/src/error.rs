//! Content cache error types.

use std::path::PathBuf;

/// Errors raised while maintaining the local content cache.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// Metadata was requested before the service announced content readiness
    /// and no local index exists.
    #[error("content is not ready yet")]
    ContentNotReady,

    /// The server selected a project the user may not use.
    #[error("no permission to use project {0}")]
    NoPermission(String),

    /// A content file name would leave the content directory.
    #[error("invalid content file name: {0}")]
    InvalidFileName(String),

    /// A content file or the index could not be read or written.
    #[error("content I/O failed for {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata index is not valid RON.
    #[error("failed to parse content index: {0}")]
    Parse(#[source] ron::error::SpannedError),

    /// The metadata index could not be serialized.
    #[error("failed to serialize content index: {0}")]
    Serialize(#[source] ron::Error),
}

impl ContentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
