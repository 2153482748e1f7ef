//! Filesystem-backed payload storage.
//!
//! Each payload is one file in a cache directory. Writes go to a temp file
//! first and are renamed into place, so a reader never sees a half-written
//! payload under its final name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lapcache_core::{LapCacheResult, StorageError};
use tracing::error;

use super::traits::ByteStorage;

/// Extension of payload files. Anything else in the directory is ignored.
pub const PAYLOAD_EXTENSION: &str = "trace";

const TEMP_EXTENSION: &str = "tmp";

/// [`ByteStorage`] over a directory.
#[derive(Debug, Clone)]
pub struct FsByteStorage {
    root: PathBuf,
}

impl FsByteStorage {
    /// Open (creating if needed) a cache directory.
    pub async fn open<P: AsRef<Path>>(root: P) -> LapCacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// The cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a handle to a path inside the cache directory.
    ///
    /// Handles are produced by the cache itself, but anything that could
    /// escape the directory is rejected anyway.
    fn path_for(&self, location: &str) -> LapCacheResult<PathBuf> {
        let valid = !location.is_empty()
            && !location.starts_with('.')
            && !location.contains(['/', '\\'])
            && location != "..";
        if !valid {
            return Err(StorageError::Io {
                location: location.to_string(),
                reason: "invalid payload handle".to_string(),
            }
            .into());
        }
        Ok(self.root.join(location))
    }
}

fn io_error(location: &str, e: std::io::Error) -> lapcache_core::LapCacheError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            location: location.to_string(),
        }
        .into()
    } else {
        StorageError::Io {
            location: location.to_string(),
            reason: e.to_string(),
        }
        .into()
    }
}

#[async_trait]
impl ByteStorage for FsByteStorage {
    async fn write(&self, location: &str, bytes: &[u8]) -> LapCacheResult<()> {
        let path = self.path_for(location)?;
        let temp_path = path.with_extension(TEMP_EXTENSION);

        tokio::fs::write(&temp_path, bytes).await.map_err(|e| {
            error!(location, error = %e, "payload write failed");
            io_error(location, e)
        })?;

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            error!(location, error = %e, "payload rename failed");
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(io_error(location, e));
        }
        Ok(())
    }

    async fn read(&self, location: &str) -> LapCacheResult<Vec<u8>> {
        let path = self.path_for(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(location, e))
    }

    async fn delete(&self, location: &str) -> LapCacheResult<()> {
        let path = self.path_for(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(location, e)),
        }
    }

    async fn exists(&self, location: &str) -> LapCacheResult<bool> {
        let path = self.path_for(location)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(location, e))
    }

    async fn list(&self) -> LapCacheResult<Vec<String>> {
        let root = self.root.display().to_string();
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&root, e))?;

        let mut handles = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&root, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PAYLOAD_EXTENSION) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                handles.push(name.to_string());
            }
        }
        handles.sort();
        Ok(handles)
    }
}
