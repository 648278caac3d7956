use crate::models::BoundingBox;
use crate::position::PositionLabel;
use crate::DocumentChunk;
use serde::Serialize;

const EXCERPT_CHARS: usize = 200;

/// Provenance for one retrieved chunk, as shown next to an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub source_num: usize,
    pub chunk_id: String,
    pub doc_name: String,
    pub page: u32,
    pub position: Option<PositionLabel>,
    pub bbox: BoundingBox,
    pub excerpt: String,
}

impl Citation {
    pub fn from_chunk(source_num: usize, chunk: &DocumentChunk) -> Self {
        Self {
            source_num,
            chunk_id: chunk.chunk_id.clone(),
            doc_name: chunk.doc_name.clone(),
            page: chunk.page,
            position: chunk.position().ok().map(|position| position.label),
            bbox: chunk.bbox,
            excerpt: excerpt(&chunk.text, EXCERPT_CHARS),
        }
    }

    /// "Page 5, top-right", or "Page 5" when the position is unavailable.
    pub fn locator(&self) -> String {
        match self.position {
            Some(label) => format!("Page {}, {label}", self.page),
            None => format!("Page {}", self.page),
        }
    }
}

fn excerpt(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Numbered source block handed to the answer-synthesis service.
pub fn source_block(source_num: usize, chunk: &DocumentChunk) -> String {
    let position = chunk
        .position()
        .map(|position| position.label.to_string())
        .unwrap_or_else(|_| "position unavailable".to_string());
    format!(
        "[Source {source_num}] Document: {}, Page {} ({position})\n{}",
        chunk.doc_name,
        chunk.page,
        chunk.text.trim_end()
    )
}

/// Joins retrieved chunks into one context string, numbering sources from 1,
/// and returns the matching citations.
pub fn build_context(chunks: &[DocumentChunk]) -> (String, Vec<Citation>) {
    let blocks = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| source_block(index + 1, chunk))
        .collect::<Vec<_>>();
    let citations = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| Citation::from_chunk(index + 1, chunk))
        .collect();
    (blocks.join("\n\n"), citations)
}
