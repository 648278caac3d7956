use crate::error::ExtractionError;
use crate::models::{DocumentChunk, RawTextBox};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Turns one document's box stream into chunks.
///
/// Boxes are ranked within their page top-to-bottom (`y0` descending), then
/// left-to-right (`x0` ascending); equal keys keep stream order. The rank is
/// the 1-based ordinal in `<doc>_p<page>_c<ordinal>`, so identical input
/// always yields identical ids. This approximates reading order for
/// single-column pages only; multi-column pages are interleaved.
///
/// Nothing is returned until the stream is exhausted, and a stream error
/// discards everything read so far.
pub fn build_document_chunks<I>(
    doc_name: &str,
    boxes: I,
    extracted_at: DateTime<Utc>,
) -> Result<Vec<DocumentChunk>, ExtractionError>
where
    I: IntoIterator<Item = Result<RawTextBox, ExtractionError>>,
{
    let mut collected = Vec::new();
    for text_box in boxes {
        let text_box = text_box?;
        if text_box.text.trim().is_empty() {
            continue;
        }

        let issues = text_box.quality_issues();
        if !issues.is_empty() {
            warn!(
                doc_name,
                page = text_box.page_index,
                bbox = ?text_box.bbox,
                issues = ?issues,
                "text box violates layout invariants"
            );
        }
        collected.push(text_box);
    }

    // Stable, so ties keep their stream order.
    collected.sort_by(reading_order);

    let mut chunks = Vec::with_capacity(collected.len());
    let mut current_page = None;
    let mut ordinal = 0usize;

    for text_box in collected {
        if current_page != Some(text_box.page_index) {
            current_page = Some(text_box.page_index);
            ordinal = 0;
        }
        ordinal += 1;

        chunks.push(DocumentChunk {
            chunk_id: DocumentChunk::make_id(doc_name, text_box.page_index, ordinal),
            doc_name: doc_name.to_string(),
            page: text_box.page_index,
            text: text_box.text,
            bbox: text_box.bbox,
            page_width: text_box.page_width,
            page_height: text_box.page_height,
            extracted_at,
        });
    }

    debug!(doc_name, chunk_count = chunks.len(), "built document chunks");
    Ok(chunks)
}

fn reading_order(left: &RawTextBox, right: &RawTextBox) -> Ordering {
    left.page_index
        .cmp(&right.page_index)
        .then_with(|| right.bbox.y0.total_cmp(&left.bbox.y0))
        .then_with(|| left.bbox.x0.total_cmp(&right.bbox.x0))
}
