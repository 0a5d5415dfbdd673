//! The set of collaborators an agent works against.
//!
//! Which implementations are used is decided once at startup from the
//! configuration and then passed around explicitly.

use std::path::Path;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::RuntimeError;
use crate::network::{HostNetwork, MemoryNetwork, Network};
use crate::runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime};
use crate::volume::{LocalVolumes, MemoryVolumes, VolumeManager};

/// Named collaborator implementations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Docker through its local socket, volumes as host directories,
    /// host ports from `/proc/net` and `iptables`.
    #[default]
    Docker,
    /// Everything in memory; nothing touches the host.
    Memory,
}

#[derive(Clone)]
pub struct Platform {
    pub backend: Backend,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub volumes: Arc<dyn VolumeManager>,
    pub network: Arc<dyn Network>,
}

impl Platform {
    pub fn new(
        backend: Backend,
        hostname: &str,
        data_path: &Path,
    ) -> Result<Self, RuntimeError> {
        info!("Using {:?} backend", backend);
        match backend {
            Backend::Docker => {
                let volume_root = data_path.join("volumes");
                Ok(Self {
                    backend,
                    runtime: Arc::new(DockerRuntime::connect(hostname, &volume_root)?),
                    volumes: Arc::new(LocalVolumes::new(volume_root)),
                    network: Arc::new(HostNetwork::new()),
                })
            }
            Backend::Memory => Ok(Self::memory()),
        }
    }

    /// The platform `config` selects for `hostname`.
    pub fn from_config(config: &Config, hostname: &str) -> Result<Self, RuntimeError> {
        Self::new(config.runtime, hostname, &config.data_path)
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            runtime: Arc::new(MemoryRuntime::new()),
            volumes: Arc::new(MemoryVolumes::new()),
            network: Arc::new(MemoryNetwork::default()),
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
