use anyhow::Context;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentSettings;
use crate::control::DEFAULT_PORT;
use crate::model::validate_hostname;
use crate::platform::Backend;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name this node goes by in deployments.  Defaults to the system
    /// hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub control_url: String,
    pub listen: SocketAddr,
    pub data_path: PathBuf,
    pub runtime: Backend,
    pub interval_secs: u64,
    pub backoff_secs: u64,
    pub poll_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            control_url: format!("http://127.0.0.1:{}", DEFAULT_PORT),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_path: PathBuf::from("/var/lib/converged"),
            runtime: Backend::Docker,
            interval_secs: 30,
            backoff_secs: 5,
            poll_secs: 5,
        }
    }
}

impl Config {
    /// Defaults, then `converged.toml`, then `converged.json`, then
    /// `CONVERGED_*` environment variables.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("converged.toml"))
            .merge(Json::file("converged.json"))
            .merge(Env::prefixed("CONVERGED_"))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    /// The configured hostname, falling back to the system's.
    pub fn hostname(&self) -> anyhow::Result<String> {
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => gethostname::gethostname()
                .into_string()
                .map_err(|raw| anyhow::anyhow!("Non-ASCII hostname: {:?}", raw))?,
        };
        validate_hostname(&hostname).context("Invalid hostname")?;
        Ok(hostname)
    }

    /// Where `serve` keeps the desired configuration.
    pub fn configuration_path(&self) -> PathBuf {
        self.data_path.join("current_configuration.v1.yaml")
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            interval: Duration::from_secs(self.interval_secs),
            backoff: Duration::from_secs(self.backoff_secs),
            poll: Duration::from_secs(self.poll_secs),
        }
    }
}
