pub mod catalog;
pub mod chunking;
pub mod citation;
pub mod error;
mod fonts;
pub mod layout;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod position;
pub mod source;
pub mod stores;
pub mod traits;

pub use catalog::{document_catalog, page_content, DocumentSummary, PageEntry};
pub use chunking::build_document_chunks;
pub use citation::{build_context, source_block, Citation};
pub use error::{ConfigError, ExtractionError, PipelineError, PositionError, StorageError};
pub use layout::{LayoutAdapter, LopdfLayoutAdapter, TextBoxStream};
pub use ledger::{Claim, LedgerBook, LedgerPolicy, PendingListing};
pub use models::{
    BoundingBox, DocumentChunk, IngestionRecord, IngestionStatus, PipelineConfig, RawTextBox,
    RunSummary,
};
pub use orchestrator::Pipeline;
pub use position::{resolve, HorizontalBand, PositionDescriptor, PositionLabel, VerticalBand};
pub use source::{discover_documents, FolderSource};
pub use stores::{FsChunkStore, FsLedger, MemoryChunkStore, MemoryLedger, WebhookNotifier};
pub use traits::{ChunkStore, DocumentSource, IndexNotifier, Ledger, NoopNotifier};
