use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{ParseError, RuntimeError};
use crate::model::{Application, AttachedVolume, DockerImage, Link, PortMap, RestartPolicy};

pub mod docker;
pub mod memory;

pub use docker::DockerRuntime;
pub use memory::MemoryRuntime;

/// Activation state reported for a unit whose container is running.
pub const ACTIVE: &str = "active";

/// A container as reported by the runtime.
///
/// Ports, links, volume and restart policy are whatever the runtime could
/// recover for the unit; a runtime that cannot report them leaves them
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: String,
    pub container_image: String,
    pub activation_state: String,
    pub ports: BTreeSet<PortMap>,
    pub links: BTreeSet<Link>,
    pub volume: Option<AttachedVolume>,
    pub restart_policy: RestartPolicy,
}

impl Unit {
    /// The unit a runtime would report after creating `application`.
    pub fn from_application(application: &Application, activation_state: &str) -> Self {
        Self {
            name: application.name.clone(),
            container_image: application.image.to_string(),
            activation_state: activation_state.to_string(),
            ports: application.ports.clone(),
            links: application.links.clone(),
            volume: application.volume.clone(),
            restart_policy: application.restart_policy,
        }
    }

    /// Only `"active"` counts as running; every other state, including ones
    /// we have never seen, does not.
    pub fn is_active(&self) -> bool {
        self.activation_state == ACTIVE
    }

    pub fn to_application(&self) -> Result<Application, ParseError> {
        Ok(Application {
            name: self.name.clone(),
            image: DockerImage::parse(&self.container_image)?,
            ports: self.ports.clone(),
            links: self.links.clone(),
            volume: self.volume.clone(),
            restart_policy: self.restart_policy,
            running: self.is_active(),
        })
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every unit the runtime manages on this node, running or not.
    async fn list_units(&self) -> Result<Vec<Unit>, RuntimeError>;

    /// Create a unit for `application`, starting it if the application is
    /// meant to be running.  Fails if a unit of that name already exists.
    async fn create(&self, application: &Application) -> Result<(), RuntimeError>;

    /// Stop and remove a unit.  Removing a unit that does not exist succeeds.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// Wake `trigger` whenever units change underneath us.  Runtimes without
    /// an event stream return immediately.
    async fn watch(&self, _trigger: Arc<Notify>) -> Result<(), RuntimeError> {
        Ok(())
    }
}
