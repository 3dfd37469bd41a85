use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::model::RemoteEntry;
use crate::traits::{StorageAdapter, StorageError};

/// Storage adapter over a local directory tree, e.g. a mounted FTP share or a
/// synced bucket. Folders and names are resolved below `root`.
#[derive(Debug, Clone)]
pub struct LocalFolderStorage {
    root: PathBuf,
}

impl LocalFolderStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Validates `relative` as a path below the storage root, rejecting any path
/// that would escape it through `..` or absolute components.
fn checked(relative: &str) -> Result<&Path, StorageError> {
    let path = Path::new(relative.trim_start_matches('/'));
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(relative.to_string()));
            }
            _ => {}
        }
    }
    Ok(path)
}

#[async_trait]
impl StorageAdapter for LocalFolderStorage {
    async fn list_entries(&self, folder: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        let dir = self.root.join(checked(folder)?);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::FolderNotFound(folder.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified_at: DateTime<Utc> = metadata.modified()?.into();
            entries.push(RemoteEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                modified_at,
            ));
        }
        Ok(entries)
    }

    async fn fetch(&self, folder: &str, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(checked(folder)?).join(checked(name)?);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
