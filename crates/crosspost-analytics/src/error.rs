//! Error types for the metrics store.

use thiserror::Error;

use crate::ContentId;

/// Errors that can occur in metrics store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An outcome record already exists for this content.
    #[error("outcome already recorded for {0}")]
    Duplicate(ContentId),

    /// No outcome record exists for this content.
    #[error("no outcome recorded for {0}")]
    NotFound(ContentId),

    /// Reading or writing the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
