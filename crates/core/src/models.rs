use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Rectangle in PDF page space: origin bottom-left, y grows upward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(rename = "bbox_x0")]
    pub x0: f64,
    #[serde(rename = "bbox_y0")]
    pub y0: f64,
    #[serde(rename = "bbox_x1")]
    pub x1: f64,
    #[serde(rename = "bbox_y1")]
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn is_ordered(&self) -> bool {
        self.x1 >= self.x0 && self.y1 >= self.y0
    }

    pub fn fits_within(&self, page_width: f64, page_height: f64) -> bool {
        self.x0 >= 0.0 && self.y0 >= 0.0 && self.x1 <= page_width && self.y1 <= page_height
    }
}

/// One text region as reported by the layout engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTextBox {
    /// 1-based page number.
    pub page_index: u32,
    pub bbox: BoundingBox,
    pub page_width: f64,
    pub page_height: f64,
    pub text: String,
}

impl RawTextBox {
    /// Describes violations of the box invariants. Parsers produce these now
    /// and then; they are reported, not rejected.
    pub fn quality_issues(&self) -> Vec<&'static str> {
        let mut issues = Vec::new();
        if !self.bbox.is_ordered() {
            issues.push("bbox corners are inverted");
        }
        if !self.bbox.fits_within(self.page_width, self.page_height) {
            issues.push("bbox extends beyond the page");
        }
        issues
    }
}

/// Persisted, write-once unit of citable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub doc_name: String,
    pub page: u32,
    pub text: String,
    #[serde(flatten)]
    pub bbox: BoundingBox,
    pub page_width: f64,
    pub page_height: f64,
    pub extracted_at: DateTime<Utc>,
}

impl DocumentChunk {
    pub fn make_id(doc_name: &str, page: u32, ordinal: usize) -> String {
        format!("{doc_name}_p{page}_c{ordinal}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub doc_name: String,
    pub status: IngestionStatus,
    pub chunk_count: usize,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    /// Number of times the document has been claimed for extraction.
    #[serde(default)]
    pub attempts: u32,
}

impl IngestionRecord {
    pub fn pending(doc_name: impl Into<String>) -> Self {
        Self {
            doc_name: doc_name.into(),
            status: IngestionStatus::Pending,
            chunk_count: 0,
            last_attempt_at: None,
            error_detail: None,
            attempts: 0,
        }
    }

    pub fn is_permanently_failed(&self, max_attempts: u32) -> bool {
        self.status == IngestionStatus::Failed && self.attempts >= max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on a single document's extraction.
    pub extraction_timeout: Duration,
    /// An `in_progress` claim older than this is treated as abandoned.
    pub stale_after: Duration,
    /// Claims allowed before a failed document stops being retried.
    pub max_attempts: u32,
    /// Minimum wait between a failure and the next retry.
    pub retry_backoff: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extraction_timeout: Duration::from_secs(120),
            stale_after: Duration::from_secs(30 * 60),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5 * 60),
        }
    }
}

impl PipelineConfig {
    /// A claim must outlive the extraction it guards, otherwise a second run
    /// reclaims a document that is still being extracted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_after <= self.extraction_timeout {
            return Err(ConfigError::StaleBeforeTimeout {
                stale_after: self.stale_after,
                extraction_timeout: self.extraction_timeout,
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub chunks_written: usize,
    pub refresh_requested: bool,
    /// Extractions that timed out; their blocking workers may still be running.
    pub abandoned_workers: usize,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            processed: 0,
            failed: 0,
            skipped: 0,
            chunks_written: 0,
            refresh_requested: false,
            abandoned_workers: 0,
        }
    }
}
