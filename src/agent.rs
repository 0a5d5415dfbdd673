//! The per-node control loop.
//!
//! Each cycle discovers what is running here, reads the desired
//! configuration, asks the deployer for a plan and applies it.  Failures of
//! any collaborator end the cycle early and are retried after a backoff
//! delay; the loop itself only stops on shutdown.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};
use tokio::time::sleep;

use crate::cluster::ClusterState;
use crate::deploy::{ApplyOutcome, Deployer};
use crate::document;
use crate::model::{Deployment, NodeState};
use crate::store::{config_digest, ConfigurationStore};

/// Where the agent is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Discovering,
    Converging,
    Applying,
}

/// How a single cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The plan was applied in full.  `changes` is its length.
    Converged { changes: usize },
    /// Shutdown was requested part way through the plan.
    Interrupted,
    DiscoveryFailed,
    StoreUnavailable,
    InvalidConfiguration,
    ActionFailed,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Converged { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    /// Delay between cycles when nothing else triggers one.
    pub interval: Duration,
    /// Delay after a failed cycle.
    pub backoff: Duration,
    /// How often the configuration store is polled for changes.
    pub poll: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            backoff: Duration::from_secs(5),
            poll: Duration::from_secs(5),
        }
    }
}

pub struct Agent {
    deployer: Deployer,
    store: Arc<dyn ConfigurationStore>,
    cluster: Arc<dyn ClusterState>,
    settings: AgentSettings,
    trigger: Arc<Notify>,
    state: watch::Sender<AgentState>,
}

impl Agent {
    pub fn new(
        deployer: Deployer,
        store: Arc<dyn ConfigurationStore>,
        cluster: Arc<dyn ClusterState>,
        settings: AgentSettings,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Idle);
        Self {
            deployer,
            store,
            cluster,
            settings,
            trigger: Arc::new(Notify::new()),
            state,
        }
    }

    pub fn settings(&self) -> AgentSettings {
        self.settings
    }

    /// Request a cycle.  Requests made while one is already pending are
    /// merged into it.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Shared handle for other tasks (store pollers, runtime watchers) to
    /// request cycles through.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
    }

    /// Run one discover, converge, apply cycle.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        let outcome = self.cycle(shutdown).await;
        self.set_state(AgentState::Idle);
        outcome
    }

    async fn cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        let hostname = self.deployer.hostname();

        self.set_state(AgentState::Discovering);
        let local = match self.deployer.discover_node_state().await {
            Ok(local) => local,
            Err(e) => {
                warn!("Could not discover state of {}: {}", hostname, e);
                return CycleOutcome::DiscoveryFailed;
            }
        };

        self.set_state(AgentState::Converging);
        let blob = match self.store.get_config().await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("{}", e);
                return CycleOutcome::StoreUnavailable;
            }
        };
        let desired = match document::decode_deployment(&blob) {
            Ok(desired) => desired,
            Err(e) => {
                error!("Ignoring stored configuration: {}", e);
                return CycleOutcome::InvalidConfiguration;
            }
        };
        let cluster = self.cluster.current().await.unwrap_or_else(|e| {
            warn!("Cluster state unavailable, using local state only: {}", e);
            Deployment::empty()
        });
        let current = cluster.with_node(local.node.clone());
        let changes = self.deployer.calculate_changes(&desired, &current);
        debug!("Planned {} changes for {}", changes.len(), hostname);

        self.set_state(AgentState::Applying);
        let applied = match self.deployer.apply_changes(&changes, shutdown).await {
            Ok(ApplyOutcome::Completed { applied }) => applied,
            Ok(ApplyOutcome::Interrupted { .. }) => return CycleOutcome::Interrupted,
            Err(e) => {
                warn!("{}", e);
                return CycleOutcome::ActionFailed;
            }
        };

        if applied > 0 {
            info!("Applied {} changes on {}", applied, hostname);
            match self.deployer.discover_node_state().await {
                Ok(state) => self.publish(&state).await,
                Err(e) => warn!("Could not rediscover state of {}: {}", hostname, e),
            }
        } else {
            self.publish(&local).await;
        }

        CycleOutcome::Converged { changes: applied }
    }

    async fn publish(&self, state: &NodeState) {
        if let Err(e) = self.cluster.publish(state).await {
            warn!("Could not publish state of {}: {}", state.hostname(), e);
        }
    }

    /// Run cycles until `shutdown` turns true or its sender goes away.
    ///
    /// The first cycle starts immediately.  After a successful cycle the
    /// next one starts when triggered or after the interval; after a failed
    /// one it starts once the backoff delay has passed.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Agent for {} started", self.deployer.hostname());
        while !*shutdown.borrow() {
            let outcome = self.run_cycle(&shutdown).await;
            if outcome == CycleOutcome::Interrupted {
                break;
            }

            let success = outcome.is_success();
            let delay = if success {
                self.settings.interval
            } else {
                self.settings.backoff
            };
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.trigger.notified(), if success => {
                    debug!("Cycle triggered");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Agent for {} stopped", self.deployer.hostname());
    }
}

/// Poll `store` and wake `trigger` whenever the stored blob changes.
pub async fn watch_configuration(
    store: Arc<dyn ConfigurationStore>,
    trigger: Arc<Notify>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last: Option<String> = None;
    while !*shutdown.borrow() {
        match store.get_config().await {
            Ok(blob) => {
                let digest = config_digest(&blob);
                if last.as_ref() != Some(&digest) {
                    if last.is_some() {
                        info!("Desired configuration changed");
                        trigger.notify_one();
                    }
                    last = Some(digest);
                }
            }
            Err(e) => debug!("Poll failed: {}", e),
        }

        tokio::select! {
            _ = sleep(poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
