//! Volume manager collaborators.
//!
//! Attaching a volume makes its data available on a node before the
//! container that mounts it starts; detaching releases it after that
//! container has stopped.  Both are idempotent.  Moving volume data between
//! nodes is not handled here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::RuntimeError;
use crate::model::AttachedVolume;

#[async_trait]
pub trait VolumeManager: Send + Sync {
    async fn attach(&self, volume: &AttachedVolume, node: &str) -> Result<(), RuntimeError>;
    async fn detach(&self, name: &str, node: &str) -> Result<(), RuntimeError>;
}

/// Host directory holding the data of volume `name`.
pub fn data_path(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// On-disk record of where a volume is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Attachment {
    name: String,
    mountpoint: PathBuf,
    node: String,
}

/// Volumes stored as directories under a root on the local host.
///
/// Data lives in `<root>/<name>`; attachment records live in
/// `<root>/.attachments/<name>.json` so they never appear inside a
/// container.  Detaching keeps the data.
#[derive(Debug, Clone)]
pub struct LocalVolumes {
    root: PathBuf,
}

impl LocalVolumes {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(".attachments").join(format!("{}.json", name))
    }

    fn check_name(name: &str) -> Result<(), RuntimeError> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(RuntimeError::Other(format!("Invalid volume name: {:?}", name)));
        }
        Ok(())
    }

    async fn read_record(&self, name: &str) -> Result<Option<Attachment>, RuntimeError> {
        match tokio::fs::read(self.record_path(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl VolumeManager for LocalVolumes {
    async fn attach(&self, volume: &AttachedVolume, node: &str) -> Result<(), RuntimeError> {
        Self::check_name(volume.name())?;

        let record = Attachment {
            name: volume.name().to_string(),
            mountpoint: volume.mountpoint().to_path_buf(),
            node: node.to_string(),
        };
        tokio::fs::create_dir_all(data_path(&self.root, volume.name())).await?;

        if self.read_record(volume.name()).await?.as_ref() == Some(&record) {
            debug!("Volume {} already attached on {}", volume.name(), node);
            return Ok(());
        }

        let path = self.record_path(volume.name());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec(&record)?).await?;
        info!(
            "Attached volume {} at {} on {}",
            volume.name(),
            volume.mountpoint().display(),
            node
        );
        Ok(())
    }

    async fn detach(&self, name: &str, node: &str) -> Result<(), RuntimeError> {
        Self::check_name(name)?;
        match tokio::fs::remove_file(self.record_path(name)).await {
            Ok(()) => {
                info!("Detached volume {} on {}", name, node);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volume manager that only remembers attachments.
#[derive(Debug, Default)]
pub struct MemoryVolumes {
    attached: Mutex<BTreeMap<String, (PathBuf, String)>>,
}

impl MemoryVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Volume name to (mountpoint, node).
    pub async fn attached(&self) -> BTreeMap<String, (PathBuf, String)> {
        self.attached.lock().await.clone()
    }
}

#[async_trait]
impl VolumeManager for MemoryVolumes {
    async fn attach(&self, volume: &AttachedVolume, node: &str) -> Result<(), RuntimeError> {
        self.attached.lock().await.insert(
            volume.name().to_string(),
            (volume.mountpoint().to_path_buf(), node.to_string()),
        );
        Ok(())
    }

    async fn detach(&self, name: &str, _node: &str) -> Result<(), RuntimeError> {
        self.attached.lock().await.remove(name);
        Ok(())
    }
}
