use std::time::Duration;
use thiserror::Error;

/// Document-level failure. Recorded in the ledger, never aborts a batch.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("document {doc_name} is unreadable: {reason}")]
    Unreadable { doc_name: String, reason: String },

    #[error("extraction of {doc_name} timed out after {after:?}")]
    Timeout { doc_name: String, after: Duration },

    #[error("extraction worker for {doc_name} stopped: {reason}")]
    WorkerStopped { doc_name: String, reason: String },
}

impl ExtractionError {
    pub fn unreadable(doc_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unreadable {
            doc_name: doc_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Chunk-level failure. The chunk is kept, only its position is unavailable.
#[derive(Debug, Clone, Copy, Error, PartialEq)]
pub enum PositionError {
    #[error("invalid page geometry: width={width}, height={height}")]
    InvalidPageGeometry { width: f64, height: f64 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("document source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("storage worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "stale_after ({stale_after:?}) must be longer than extraction_timeout ({extraction_timeout:?})"
    )]
    StaleBeforeTimeout {
        stale_after: Duration,
        extraction_timeout: Duration,
    },

    #[error("max_attempts must be at least 1")]
    NoAttempts,
}

/// Batch-level failure surfaced by `Pipeline::run_once`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;
