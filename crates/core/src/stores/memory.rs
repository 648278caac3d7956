use crate::ledger::{Claim, LedgerBook, LedgerPolicy, PendingListing};
use crate::traits::{ChunkStore, Ledger};
use crate::{DocumentChunk, IngestionRecord, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    documents: RwLock<BTreeMap<String, Vec<DocumentChunk>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn replace_document(
        &self,
        doc_name: &str,
        chunks: Vec<DocumentChunk>,
    ) -> Result<(), StorageError> {
        let mut documents = self.documents.write().await;
        documents.remove(doc_name);
        if !chunks.is_empty() {
            documents.insert(doc_name.to_string(), chunks);
        }
        Ok(())
    }

    async fn document_chunks(&self, doc_name: &str) -> Result<Vec<DocumentChunk>, StorageError> {
        Ok(self
            .documents
            .read()
            .await
            .get(doc_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn document_names(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.documents.read().await.keys().cloned().collect())
    }
}

#[derive(Debug)]
pub struct MemoryLedger {
    book: Mutex<LedgerBook>,
    policy: LedgerPolicy,
}

impl MemoryLedger {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            book: Mutex::new(LedgerBook::default()),
            policy,
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(LedgerPolicy::default())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn list_pending(
        &self,
        present: &[String],
        now: DateTime<Utc>,
    ) -> Result<PendingListing, StorageError> {
        let (listing, _) = self.book.lock().await.list_pending(present, now, &self.policy);
        Ok(listing)
    }

    async fn mark_in_progress(
        &self,
        doc_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim, StorageError> {
        Ok(self.book.lock().await.claim(doc_name, now, &self.policy))
    }

    async fn mark_complete(
        &self,
        doc_name: &str,
        chunk_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.book.lock().await.complete(doc_name, chunk_count, now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        doc_name: &str,
        error_detail: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.book.lock().await.fail(doc_name, error_detail, now);
        Ok(())
    }

    async fn records(&self) -> Result<Vec<IngestionRecord>, StorageError> {
        Ok(self.book.lock().await.records())
    }
}
