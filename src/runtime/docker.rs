use super::{ContainerRuntime, Unit};
use crate::error::RuntimeError;
use crate::model::{Application, AttachedVolume, Link, PortMap, RestartPolicy};
use crate::volume;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicyNameEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Label marking containers this agent owns.
const MANAGED_LABEL: &str = "converged.managed";
/// Label carrying the parts of the application the runtime cannot report.
const CONFIG_LABEL: &str = "converged.config";

/// Application settings stored on the container so discovery can recover
/// them.  Docker reports ports and mounts, but not in a form that maps back
/// onto links, volume names or our restart policies.
#[derive(Debug, Default, Serialize, Deserialize)]
struct UnitConfig {
    #[serde(default)]
    ports: Vec<(u16, u16)>,
    #[serde(default)]
    links: Vec<(u16, u16, String)>,
    #[serde(default)]
    volume: Option<(String, PathBuf)>,
    #[serde(default)]
    restart_policy: Option<(String, Option<u32>)>,
}

impl UnitConfig {
    fn from_application(application: &Application) -> Self {
        let restart_policy = match application.restart_policy {
            RestartPolicy::Never => None,
            RestartPolicy::Always => Some(("always".to_string(), None)),
            RestartPolicy::OnFailure {
                maximum_retry_count,
            } => Some((
                "on-failure".to_string(),
                maximum_retry_count.map(NonZeroU32::get),
            )),
        };
        Self {
            ports: application
                .ports
                .iter()
                .map(|p| (p.internal_port, p.external_port))
                .collect(),
            links: application
                .links
                .iter()
                .map(|l| (l.local_port, l.remote_port, l.alias.clone()))
                .collect(),
            volume: application
                .volume
                .as_ref()
                .map(|v| (v.name().to_string(), v.mountpoint().to_path_buf())),
            restart_policy,
        }
    }

    fn apply_to(self, unit: &mut Unit) {
        unit.ports = self
            .ports
            .into_iter()
            .map(|(internal, external)| PortMap::new(internal, external))
            .collect();
        unit.links = self
            .links
            .into_iter()
            .map(|(local_port, remote_port, alias)| Link {
                local_port,
                remote_port,
                alias,
            })
            .collect();
        unit.volume = self.volume.and_then(|(name, mountpoint)| {
            AttachedVolume::new(name, mountpoint)
                .map_err(|e| warn!("Ignoring volume label on {}: {}", unit.name, e))
                .ok()
        });
        unit.restart_policy = match self.restart_policy {
            Some((name, _)) if name == "always" => RestartPolicy::Always,
            Some((name, maximum_retry_count)) if name == "on-failure" => RestartPolicy::OnFailure {
                maximum_retry_count: maximum_retry_count.and_then(NonZeroU32::new),
            },
            _ => RestartPolicy::Never,
        };
    }
}

pub struct DockerRuntime {
    docker: Docker,
    hostname: String,
    volume_root: PathBuf,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.  Volumes are bind-mounted from
    /// directories under `volume_root`, and links resolve to `hostname`.
    pub fn connect(hostname: impl Into<String>, volume_root: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        // Handles the unix socket on Linux and honours DOCKER_HOST.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            hostname: hostname.into(),
            volume_root: volume_root.into(),
        })
    }

    fn managed_filter() -> HashMap<String, Vec<String>> {
        [("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)])]
            .into_iter()
            .collect()
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        info!("Pulling image: {}", reference);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: reference.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(msg) = stream.next().await {
            let info = msg?;
            if let Some(status) = info.status {
                debug!("{}: {}", reference, status);
            }
        }
        Ok(())
    }

    fn container_config(&self, application: &Application) -> Result<Config<String>, RuntimeError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &application.ports {
            let key = format!("{}/tcp", port.internal_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.external_port.to_string()),
                }]),
            );
        }

        let env: Vec<String> = application
            .links
            .iter()
            .flat_map(|link| link_environment(link, &self.hostname))
            .collect();

        let binds = application.volume.as_ref().map(|v| {
            vec![format!(
                "{}:{}",
                volume::data_path(&self.volume_root, v.name()).display(),
                v.mountpoint().display()
            )]
        });

        let (name, maximum_retry_count) = match application.restart_policy {
            RestartPolicy::Never => (RestartPolicyNameEnum::NO, None),
            RestartPolicy::Always => (RestartPolicyNameEnum::ALWAYS, None),
            RestartPolicy::OnFailure {
                maximum_retry_count,
            } => (
                RestartPolicyNameEnum::ON_FAILURE,
                maximum_retry_count.map(|count| i64::from(count.get())),
            ),
        };

        let labels: HashMap<String, String> = [
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (
                CONFIG_LABEL.to_string(),
                serde_json::to_string(&UnitConfig::from_application(application))?,
            ),
        ]
        .into_iter()
        .collect();

        Ok(Config {
            image: Some(application.image.to_string()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                binds,
                restart_policy: Some(bollard::models::RestartPolicy {
                    name: Some(name),
                    maximum_retry_count,
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_units(&self) -> Result<Vec<Unit>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            filters: Self::managed_filter(),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut units = Vec::new();
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let name = match (name, c.id.clone()) {
                (Some(n), _) => n,
                (_, Some(id)) => id,
                _ => continue,
            };

            let mut unit = Unit {
                name,
                container_image: c.image.clone().unwrap_or_default(),
                activation_state: activation_state(c.state.as_deref()).to_string(),
                ports: BTreeSet::new(),
                links: BTreeSet::new(),
                volume: None,
                restart_policy: RestartPolicy::Never,
            };
            match c.labels.as_ref().and_then(|l| l.get(CONFIG_LABEL)) {
                Some(label) => match serde_json::from_str::<UnitConfig>(label) {
                    Ok(config) => config.apply_to(&mut unit),
                    Err(e) => warn!("Unreadable {} label on {}: {}", CONFIG_LABEL, unit.name, e),
                },
                None => warn!("Container {} has no {} label", unit.name, CONFIG_LABEL),
            }
            units.push(unit);
        }
        Ok(units)
    }

    async fn create(&self, application: &Application) -> Result<(), RuntimeError> {
        self.pull_image(&application.image.to_string()).await?;

        let config = self.container_config(application)?;
        let options = Some(CreateContainerOptions {
            name: application.name.clone(),
            ..Default::default()
        });
        let created = self.docker.create_container(options, config).await?;
        info!("Container created: {} ({})", application.name, created.id);

        if application.running {
            self.docker
                .start_container(&application.name, None::<StartContainerOptions<String>>)
                .await?;
            info!("Container started: {}", application.name);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        match self.docker.stop_container(name, None).await {
            Ok(()) => info!("Container stopped: {}", name),
            Err(e) if is_status(&e, 304) => debug!("Container {} was not running", name),
            Err(e) if is_status(&e, 404) => {
                debug!("Container {} already gone", name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(opts)).await {
            Ok(()) => {
                info!("Container removed: {}", name);
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(&self, trigger: Arc<Notify>) -> Result<(), RuntimeError> {
        loop {
            let mut filters = Self::managed_filter();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert(
                "event".to_string(),
                ["start", "die", "kill", "stop", "destroy"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            );
            let opts = EventsOptions::<String> {
                filters,
                ..Default::default()
            };

            let mut stream = self.docker.events(Some(opts));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(event) => {
                        let action = event.action.unwrap_or_default();
                        let name = event
                            .actor
                            .and_then(|actor| actor.attributes)
                            .and_then(|attributes| attributes.get("name").cloned())
                            .unwrap_or_default();
                        debug!("Container event: {} for {}", action, name);
                        trigger.notify_one();
                    }
                    Err(e) => {
                        error!("Error in Docker event stream: {}", e);
                        break; // Break inner loop to reconnect
                    }
                }
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

fn is_status(err: &bollard::errors::Error, status: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}

/// Map a Docker container state onto a unit activation state.
fn activation_state(state: Option<&str>) -> &'static str {
    match state {
        Some("running") => "active",
        Some("created") | Some("restarting") => "activating",
        Some("paused") | Some("exited") => "inactive",
        Some("removing") => "deactivating",
        Some("dead") => "failed",
        _ => "unknown",
    }
}

/// Docker-link style environment variables for `link`, pointing at `host`.
fn link_environment(link: &Link, host: &str) -> Vec<String> {
    let prefix = format!(
        "{}_PORT_{}_TCP",
        link.alias.to_uppercase().replace('-', "_"),
        link.local_port
    );
    vec![
        format!("{}=tcp://{}:{}", prefix, host, link.remote_port),
        format!("{}_PROTO=tcp", prefix),
        format!("{}_ADDR={}", prefix, host),
        format!("{}_PORT={}", prefix, link.remote_port),
    ]
}
