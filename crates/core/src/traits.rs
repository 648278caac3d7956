use crate::ledger::{Claim, PendingListing};
use crate::{DocumentChunk, IngestionRecord, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Lists the documents currently present in source storage.
#[async_trait]
pub trait DocumentSource {
    async fn list_documents(&self) -> Result<Vec<String>, StorageError>;
}

#[async_trait]
pub trait ChunkStore {
    /// Drops every stored chunk of `doc_name`, then stores `chunks`, as one step.
    async fn replace_document(
        &self,
        doc_name: &str,
        chunks: Vec<DocumentChunk>,
    ) -> Result<(), StorageError>;

    async fn document_chunks(&self, doc_name: &str) -> Result<Vec<DocumentChunk>, StorageError>;

    async fn document_names(&self) -> Result<Vec<String>, StorageError>;
}

#[async_trait]
pub trait Ledger {
    async fn list_pending(
        &self,
        present: &[String],
        now: DateTime<Utc>,
    ) -> Result<PendingListing, StorageError>;

    /// Atomic claim. A `Claim::Conflict` means another run owns the document.
    async fn mark_in_progress(
        &self,
        doc_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim, StorageError>;

    async fn mark_complete(
        &self,
        doc_name: &str,
        chunk_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn mark_failed(
        &self,
        doc_name: &str,
        error_detail: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn records(&self) -> Result<Vec<IngestionRecord>, StorageError>;
}

/// Downstream search index. Refresh is fire-and-forget.
pub trait IndexNotifier {
    fn request_refresh(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl IndexNotifier for NoopNotifier {
    fn request_refresh(&self) {}
}

