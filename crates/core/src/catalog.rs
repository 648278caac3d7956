use crate::position::PositionDescriptor;
use crate::traits::ChunkStore;
use crate::{DocumentChunk, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub doc_name: String,
    pub total_pages: u32,
    pub total_chunks: usize,
    pub first_extracted: Option<DateTime<Utc>>,
    pub last_extracted: Option<DateTime<Utc>>,
}

impl DocumentSummary {
    fn from_chunks(doc_name: String, chunks: &[DocumentChunk]) -> Self {
        Self {
            doc_name,
            total_pages: chunks.iter().map(|chunk| chunk.page).max().unwrap_or(0),
            total_chunks: chunks.len(),
            first_extracted: chunks.iter().map(|chunk| chunk.extracted_at).min(),
            last_extracted: chunks.iter().map(|chunk| chunk.extracted_at).max(),
        }
    }
}

/// Every stored document with page and chunk counts, ordered by name.
pub async fn document_catalog<C>(store: &C) -> Result<Vec<DocumentSummary>, StorageError>
where
    C: ChunkStore + Sync + ?Sized,
{
    let mut summaries = Vec::new();
    for doc_name in store.document_names().await? {
        let chunks = store.document_chunks(&doc_name).await?;
        summaries.push(DocumentSummary::from_chunks(doc_name, &chunks));
    }
    summaries.sort_by(|left, right| left.doc_name.cmp(&right.doc_name));
    Ok(summaries)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageEntry {
    pub chunk: DocumentChunk,
    /// `None` when the page geometry is unusable.
    pub position: Option<PositionDescriptor>,
}

/// Chunks of one page, top of the page first, then left to right.
pub async fn page_content<C>(
    store: &C,
    doc_name: &str,
    page: u32,
) -> Result<Vec<PageEntry>, StorageError>
where
    C: ChunkStore + Sync + ?Sized,
{
    let mut chunks = store
        .document_chunks(doc_name)
        .await?
        .into_iter()
        .filter(|chunk| chunk.page == page)
        .collect::<Vec<_>>();
    chunks.sort_by(|left, right| {
        right
            .bbox
            .y0
            .total_cmp(&left.bbox.y0)
            .then_with(|| left.bbox.x0.total_cmp(&right.bbox.x0))
    });

    Ok(chunks
        .into_iter()
        .map(|chunk| {
            let position = match chunk.position() {
                Ok(position) => Some(position),
                Err(error) => {
                    warn!(chunk_id = %chunk.chunk_id, %error, "position unavailable");
                    None
                }
            };
            PageEntry { chunk, position }
        })
        .collect())
}
