use crate::traits::DocumentSource;
use crate::StorageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// `path` relative to `root`, components joined with `/` on every platform.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Names of every PDF under `root`, recursively, sorted. Entries that cannot
/// be read or whose path is not UTF-8 are skipped with a warning.
pub fn discover_documents(root: &Path) -> Vec<String> {
    let mut names = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%error, "skipping unreadable source entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_pdf(entry.path()))
        .filter_map(|entry| {
            let name = relative_name(root, entry.path());
            if name.is_none() {
                warn!(path = %entry.path().display(), "skipping document with a non UTF-8 name");
            }
            name
        })
        .collect::<Vec<_>>();
    names.sort_unstable();
    names
}

/// Source storage backed by a local folder. Document names are paths
/// relative to the folder, `/`-separated, so they can be joined back onto
/// the same root by the layout adapter.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
}

impl FolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentSource for FolderSource {
    async fn list_documents(&self) -> Result<Vec<String>, StorageError> {
        if !self.root.is_dir() {
            return Err(StorageError::SourceUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || discover_documents(&root))
            .await
            .map_err(|error| StorageError::Worker(error.to_string()))
    }
}
