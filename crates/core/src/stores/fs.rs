use crate::ledger::{Claim, LedgerBook, LedgerPolicy, PendingListing};
use crate::traits::{ChunkStore, Ledger};
use crate::{DocumentChunk, IngestionRecord, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use fd_lock::RwLock;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Writes to a sibling temp file, then renames over `path`, so readers see
/// either the old or the new content.
async fn write_json_atomically<T>(path: &Path, value: &T) -> Result<(), StorageError>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value)?;
    let temp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&temp, bytes).await?;
    if let Err(error) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(error.into());
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    doc_name: String,
    chunks: Vec<DocumentChunk>,
}

/// One JSON file per document, named by the SHA-256 of its name.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    dir: PathBuf,
}

impl FsChunkStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn document_path(&self, doc_name: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(doc_name.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    async fn read_document(path: &Path) -> Result<Option<StoredDocument>, StorageError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn replace_document(
        &self,
        doc_name: &str,
        chunks: Vec<DocumentChunk>,
    ) -> Result<(), StorageError> {
        let path = self.document_path(doc_name);
        if chunks.is_empty() {
            return match fs::remove_file(&path).await {
                Err(error) if error.kind() != ErrorKind::NotFound => Err(error.into()),
                _ => Ok(()),
            };
        }

        let stored = StoredDocument {
            doc_name: doc_name.to_string(),
            chunks,
        };
        write_json_atomically(&path, &stored).await?;
        debug!(
            doc_name,
            path = %path.display(),
            chunk_count = stored.chunks.len(),
            "stored chunks"
        );
        Ok(())
    }

    async fn document_chunks(&self, doc_name: &str) -> Result<Vec<DocumentChunk>, StorageError> {
        Ok(Self::read_document(&self.document_path(doc_name))
            .await?
            .map(|stored| stored.chunks)
            .unwrap_or_default())
    }

    async fn document_names(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stored) = Self::read_document(&path).await? {
                names.push(stored.doc_name);
            }
        }
        names.sort_unstable();
        Ok(names)
    }
}

/// Ledger persisted as a single JSON file next to a `.lock` file.
///
/// Every operation takes an exclusive OS lock on the lock file, re-reads the
/// ledger from disk, applies the change and writes it back before releasing
/// the lock. A claim is therefore one check-and-set for every process that
/// opens the same path, not only for runs sharing this handle.
#[derive(Debug)]
pub struct FsLedger {
    path: PathBuf,
    lock_path: PathBuf,
    policy: LedgerPolicy,
}

impl FsLedger {
    pub async fn open(
        path: impl Into<PathBuf>,
        policy: LedgerPolicy,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let lock_path = path.with_extension("lock");

        let ledger = Self {
            path,
            lock_path,
            policy,
        };
        // Surface a corrupt ledger at open time rather than mid-pass.
        ledger.records().await?;
        Ok(ledger)
    }

    async fn update<T>(
        &self,
        change: impl FnOnce(&mut LedgerBook, &LedgerPolicy) -> (T, bool) + Send + 'static,
    ) -> Result<T, StorageError>
    where
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        let policy = self.policy;
        tokio::task::spawn_blocking(move || -> Result<T, StorageError> {
            let mut lock = open_lock_file(&lock_path)?;
            let _guard = lock.write()?;
            let mut book = read_book(&path)?;
            let (value, changed) = change(&mut book, &policy);
            if changed {
                write_records(&path, &book.records())?;
            }
            Ok(value)
        })
        .await
        .map_err(|error| StorageError::Worker(error.to_string()))?
    }
}

fn open_lock_file(lock_path: &Path) -> Result<RwLock<std::fs::File>, StorageError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)?;
    Ok(RwLock::new(file))
}

fn read_book(path: &Path) -> Result<LedgerBook, StorageError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let records: Vec<IngestionRecord> = serde_json::from_slice(&bytes)?;
            Ok(LedgerBook::from_records(records))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(LedgerBook::default()),
        Err(error) => Err(error.into()),
    }
}

/// Blocking twin of `write_json_atomically`, used while the ledger lock is held.
fn write_records(path: &Path, records: &[IngestionRecord]) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(records)?;
    let temp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    std::fs::write(&temp, bytes)?;
    if let Err(error) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(error.into());
    }
    Ok(())
}

#[async_trait]
impl Ledger for FsLedger {
    async fn list_pending(
        &self,
        present: &[String],
        now: DateTime<Utc>,
    ) -> Result<PendingListing, StorageError> {
        let present = present.to_vec();
        self.update(move |book, policy| book.list_pending(&present, now, policy))
            .await
    }

    async fn mark_in_progress(
        &self,
        doc_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Claim, StorageError> {
        let doc_name = doc_name.to_string();
        self.update(move |book, policy| {
            let claim = book.claim(&doc_name, now, policy);
            (claim, claim == Claim::Claimed)
        })
        .await
    }

    async fn mark_complete(
        &self,
        doc_name: &str,
        chunk_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let doc_name = doc_name.to_string();
        self.update(move |book, _| {
            book.complete(&doc_name, chunk_count, now);
            ((), true)
        })
        .await
    }

    async fn mark_failed(
        &self,
        doc_name: &str,
        error_detail: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let doc_name = doc_name.to_string();
        let error_detail = error_detail.to_string();
        self.update(move |book, _| {
            book.fail(&doc_name, &error_detail, now);
            ((), true)
        })
        .await
    }

    async fn records(&self) -> Result<Vec<IngestionRecord>, StorageError> {
        self.update(|book, _| (book.records(), false)).await
    }
}
