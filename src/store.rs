//! Durable storage for the desired configuration.
//!
//! The store keeps one opaque blob.  It knows nothing about the document
//! inside it; encoding and decoding belong to [`crate::document`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;

#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// The last blob written, or an empty blob if nothing has been written.
    async fn get_config(&self) -> Result<Vec<u8>, StoreError>;

    /// Replace the stored blob.  Once this returns, every later
    /// `get_config` observes this blob or a newer one.
    async fn set_config(&self, config: Vec<u8>) -> Result<(), StoreError>;
}

/// Hex SHA-256 of a configuration blob, used to notice changes when polling.
pub fn config_digest(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

/// A store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Vec<u8>) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }
}

#[async_trait]
impl ConfigurationStore for MemoryStore {
    async fn get_config(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.config.read().await.clone())
    }

    async fn set_config(&self, config: Vec<u8>) -> Result<(), StoreError> {
        *self.config.write().await = config;
        Ok(())
    }
}

/// A store backed by a single file.
///
/// Writes go to a sibling temporary file which is synced and then renamed
/// over the target, so readers see either the old blob or the new one.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temporary_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigurationStore for FileStore {
    async fn get_config(&self) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(config) => Ok(config),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_config(&self, config: Vec<u8>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temporary = self.temporary_path();
        let mut file = tokio::fs::File::create(&temporary).await?;
        file.write_all(&config).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temporary, &self.path).await?;
        debug!(
            "Stored {} byte configuration at {}",
            config.len(),
            self.path.display()
        );
        Ok(())
    }
}
