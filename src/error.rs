//! Error types for catalog operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors surfaced by the catalog, its stores and the statistics engine.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Malformed or missing input. Reported to the caller, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The content fingerprint is already cataloged.
    ///
    /// The upload flow treats this as an "already exists" outcome rather than
    /// a failure.
    #[error("fingerprint {fingerprint} already cataloged as painting {existing_id}")]
    DuplicateFingerprint { fingerprint: String, existing_id: i64 },

    /// An id, fingerprint or file is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path resolved outside the storage root.
    #[error("access outside storage root refused: {}", path.display())]
    Permission { path: PathBuf },

    /// Writing an asset or sidecar to disk failed.
    #[error("failed to write {}: {source}", path.display())]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected failure while computing statistics.
    #[error("statistics aggregation failed: {0}")]
    Aggregation(String),

    /// The enrichment service failed or timed out.
    #[error("enrichment service error: {0}")]
    ExternalService(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    pub(crate) fn storage_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CatalogError::StorageWrite {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        CatalogError::NotFound(what.into())
    }
}
