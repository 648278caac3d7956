pub mod fs;
pub mod memory;
pub mod webhook;

pub use fs::{FsChunkStore, FsLedger};
pub use memory::{MemoryChunkStore, MemoryLedger};
pub use webhook::WebhookNotifier;
