//! The convergence engine.
//!
//! [`calculate_changes`] compares the desired and current state of one node
//! and returns the changes that take it from one to the other.  It is a pure
//! function.  [`Deployer`] executes those changes against the node's
//! collaborators.
//!
//! Applications are matched by name.  An application whose value differs
//! between the two states is stopped and started again rather than treated
//! as a removal plus an addition.  Every stop (with its volume detach and
//! port closes) comes before every start (with its volume attach and port
//! opens), so an old and a new instance never hold the same volume or host
//! port at once.  Within each group applications are taken in name order.
//!
//! Plans are never saved.  A plan that was only partly applied is simply
//! recalculated from freshly observed state on the next cycle, which is why
//! every change must be safe to apply twice.

use std::fmt;

use log::{debug, info};
use tokio::sync::watch;

use crate::discovery;
use crate::error::{ActionError, DiscoveryError, RuntimeError};
use crate::model::{Application, AttachedVolume, Deployment, NodeState};
use crate::platform::Platform;

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    StopApplication { application: Application },
    DetachVolume { volume: AttachedVolume },
    ClosePort { port: u16 },
    AttachVolume { volume: AttachedVolume },
    OpenPort { port: u16 },
    StartApplication { application: Application },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::StopApplication { application } => write!(f, "stop({})", application.name),
            Change::DetachVolume { volume } => write!(f, "detach({})", volume.name()),
            Change::ClosePort { port } => write!(f, "close-port({})", port),
            Change::AttachVolume { volume } => write!(
                f,
                "attach({}, {})",
                volume.name(),
                volume.mountpoint().display()
            ),
            Change::OpenPort { port } => write!(f, "open-port({})", port),
            Change::StartApplication { application } => write!(f, "start({})", application.name),
        }
    }
}

fn stop_changes(application: &Application) -> impl Iterator<Item = Change> {
    let stop = Change::StopApplication {
        application: application.clone(),
    };
    let detach = application
        .volume
        .clone()
        .map(|volume| Change::DetachVolume { volume });
    let close = application.ports.iter().map(|p| Change::ClosePort {
        port: p.external_port,
    });
    std::iter::once(stop)
        .chain(detach)
        .chain(close.collect::<Vec<_>>())
}

fn start_changes(application: &Application) -> impl Iterator<Item = Change> {
    let attach = application
        .volume
        .clone()
        .map(|volume| Change::AttachVolume { volume });
    let open = application.ports.iter().map(|p| Change::OpenPort {
        port: p.external_port,
    });
    let start = Change::StartApplication {
        application: application.clone(),
    };
    attach
        .into_iter()
        .chain(open.collect::<Vec<_>>())
        .chain(std::iter::once(start))
}

/// The plan that converges `hostname` from `current` to `desired`.
///
/// Only applications on `hostname` are considered; a node missing from
/// either deployment counts as a node with no applications.
pub fn calculate_changes(desired: &Deployment, current: &Deployment, hostname: &str) -> Vec<Change> {
    let desired_node = desired.node(hostname);
    let current_node = current.node(hostname);

    let mut changes = Vec::new();
    for application in current_node.into_iter().flat_map(|n| n.applications()) {
        let wanted = desired_node.and_then(|n| n.application(&application.name));
        if wanted != Some(application) {
            changes.extend(stop_changes(application));
        }
    }
    for application in desired_node.into_iter().flat_map(|n| n.applications()) {
        let running = current_node.and_then(|n| n.application(&application.name));
        if running != Some(application) {
            changes.extend(start_changes(application));
        }
    }
    changes
}

/// How far a plan got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Completed { applied: usize },
    /// Shutdown was requested between two changes.
    Interrupted { applied: usize },
}

/// Applies plans to the node it runs on.
#[derive(Debug, Clone)]
pub struct Deployer {
    hostname: String,
    platform: Platform,
}

impl Deployer {
    pub fn new(hostname: impl Into<String>, platform: Platform) -> Self {
        Self {
            hostname: hostname.into(),
            platform,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub async fn discover_node_state(&self) -> Result<NodeState, DiscoveryError> {
        discovery::discover_node_state(
            self.platform.runtime.as_ref(),
            self.platform.network.as_ref(),
            &self.hostname,
        )
        .await
    }

    pub fn calculate_changes(&self, desired: &Deployment, current: &Deployment) -> Vec<Change> {
        calculate_changes(desired, current, &self.hostname)
    }

    /// Apply `changes` in order.
    ///
    /// The first failure abandons the rest of the plan.  `shutdown` is only
    /// checked between changes; a change that has started is always allowed
    /// to finish.
    pub async fn apply_changes(
        &self,
        changes: &[Change],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ApplyOutcome, ActionError> {
        for (applied, change) in changes.iter().enumerate() {
            if *shutdown.borrow() {
                info!(
                    "Shutdown requested, leaving {} of {} changes unapplied",
                    changes.len() - applied,
                    changes.len()
                );
                return Ok(ApplyOutcome::Interrupted { applied });
            }
            info!("Applying {}", change);
            self.apply(change).await.map_err(|source| ActionError {
                change: change.clone(),
                source,
            })?;
        }
        Ok(ApplyOutcome::Completed {
            applied: changes.len(),
        })
    }

    /// Calculate and apply the plan for this node.
    pub async fn change_node_state(
        &self,
        desired: &Deployment,
        current: &Deployment,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ApplyOutcome, ActionError> {
        let changes = self.calculate_changes(desired, current);
        self.apply_changes(&changes, shutdown).await
    }

    async fn apply(&self, change: &Change) -> Result<(), RuntimeError> {
        let platform = &self.platform;
        match change {
            Change::StopApplication { application } => platform.runtime.remove(&application.name).await,
            Change::DetachVolume { volume } => platform.volumes.detach(volume.name(), &self.hostname).await,
            Change::ClosePort { port } => platform.network.close_port(*port).await,
            Change::AttachVolume { volume } => platform.volumes.attach(volume, &self.hostname).await,
            Change::OpenPort { port } => platform.network.open_port(*port).await,
            Change::StartApplication { application } => self.start(application).await,
        }
    }

    /// Start `application` unless an identical unit is already there.  A
    /// unit of the same name in any other configuration is replaced.
    async fn start(&self, application: &Application) -> Result<(), RuntimeError> {
        let runtime = &self.platform.runtime;
        let units = runtime.list_units().await?;
        if let Some(unit) = units.iter().find(|u| u.name == application.name) {
            if unit.to_application().ok().as_ref() == Some(application) {
                debug!("{} is already in the desired state", application.name);
                return Ok(());
            }
            debug!("Replacing stale unit {}", unit.name);
            runtime.remove(&unit.name).await?;
        }
        runtime.create(application).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DockerImage, Node, PortMap};
    use crate::network::MemoryNetwork;
    use crate::runtime::{ContainerRuntime, MemoryRuntime, Unit};
    use crate::testing;
    use crate::volume::MemoryVolumes;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn app(name: &str, image: &str) -> Application {
        Application::new(name, DockerImage::parse(image).unwrap())
    }

    fn deployment(hostname: &str, applications: Vec<Application>) -> Deployment {
        Deployment::new([Node::new(hostname, applications).unwrap()]).unwrap()
    }

    fn names(changes: &[Change]) -> Vec<String> {
        changes.iter().map(ToString::to_string).collect()
    }

    struct Harness {
        runtime: Arc<MemoryRuntime>,
        volumes: Arc<MemoryVolumes>,
        network: Arc<MemoryNetwork>,
        deployer: Deployer,
    }

    fn harness(hostname: &str) -> Harness {
        let runtime = Arc::new(MemoryRuntime::new());
        let volumes = Arc::new(MemoryVolumes::new());
        let network = Arc::new(MemoryNetwork::default());
        let platform = Platform {
            backend: crate::platform::Backend::Memory,
            runtime: runtime.clone(),
            volumes: volumes.clone(),
            network: network.clone(),
        };
        Harness {
            runtime,
            volumes,
            network,
            deployer: Deployer::new(hostname, platform),
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn test_add_application() {
        let desired = deployment("h1", vec![app("web", "nginx:latest")]);
        let current = deployment("h1", vec![]);
        assert_eq!(names(&calculate_changes(&desired, &current, "h1")), ["start(web)"]);
    }

    #[test]
    fn test_changed_application_restarts() {
        let desired = deployment("h1", vec![app("web", "nginx:2")]);
        let current = deployment("h1", vec![app("web", "nginx:1")]);
        let changes = calculate_changes(&desired, &current, "h1");
        assert_eq!(
            changes,
            vec![
                Change::StopApplication {
                    application: app("web", "nginx:1")
                },
                Change::StartApplication {
                    application: app("web", "nginx:2")
                },
            ]
        );
    }

    #[test]
    fn test_volume_lifecycle() {
        let volume = AttachedVolume::new("db-vol", "/data").unwrap();
        let desired = deployment("h1", vec![app("db", "postgres").with_volume(volume.clone())]);
        let current = deployment("h1", vec![]);
        assert_eq!(
            names(&calculate_changes(&desired, &current, "h1")),
            ["attach(db-vol, /data)", "start(db)"]
        );

        // And back out again: detach follows stop.
        assert_eq!(
            names(&calculate_changes(&current, &desired, "h1")),
            ["stop(db)", "detach(db-vol)"]
        );
    }

    #[test]
    fn test_identical_state_needs_no_changes() {
        let volume = AttachedVolume::new("db-vol", "/data").unwrap();
        let state = Deployment::new([
            Node::new(
                "h1",
                [
                    app("web", "nginx:1").with_ports([PortMap::new(80, 8080)]),
                    app("db", "postgres:16").with_volume(volume),
                ],
            )
            .unwrap(),
            Node::new("h2", [app("cache", "redis")]).unwrap(),
        ])
        .unwrap();

        for hostname in ["h1", "h2", "h3"] {
            assert!(calculate_changes(&state, &state, hostname).is_empty());
        }
    }

    #[test]
    fn test_only_the_named_node_is_converged() {
        let desired = Deployment::new([
            Node::new("h1", [app("web", "nginx")]).unwrap(),
            Node::new("h2", [app("db", "postgres")]).unwrap(),
        ])
        .unwrap();
        let current = Deployment::empty();
        assert_eq!(names(&calculate_changes(&desired, &current, "h2")), ["start(db)"]);
    }

    #[test]
    fn test_missing_nodes_count_as_empty() {
        let current = deployment("h1", vec![app("web", "nginx")]);
        assert_eq!(
            names(&calculate_changes(&Deployment::empty(), &current, "h1")),
            ["stop(web)"]
        );
        assert!(calculate_changes(&Deployment::empty(), &Deployment::empty(), "h1").is_empty());
    }

    #[test]
    fn test_stopped_application_is_restarted() {
        let desired = deployment("h1", vec![app("web", "nginx")]);
        let current = deployment("h1", vec![app("web", "nginx").with_running(false)]);
        assert_eq!(
            names(&calculate_changes(&desired, &current, "h1")),
            ["stop(web)", "start(web)"]
        );
    }

    #[test]
    fn test_all_stops_precede_all_starts() {
        // "old" gives up port 8080 and its volume, which "new" takes over;
        // "web" is restarted on the same port.
        let shared = AttachedVolume::new("shared", "/data").unwrap();
        let current = deployment(
            "h1",
            vec![
                app("old", "app:1")
                    .with_ports([PortMap::new(80, 8080)])
                    .with_volume(shared.clone()),
                app("web", "nginx:1").with_ports([PortMap::new(80, 9090)]),
            ],
        );
        let desired = deployment(
            "h1",
            vec![
                app("new", "app:2")
                    .with_ports([PortMap::new(80, 8080)])
                    .with_volume(shared),
                app("web", "nginx:2").with_ports([PortMap::new(80, 9090)]),
            ],
        );

        assert_eq!(
            names(&calculate_changes(&desired, &current, "h1")),
            [
                "stop(old)",
                "detach(shared)",
                "close-port(8080)",
                "stop(web)",
                "close-port(9090)",
                "attach(shared, /data)",
                "open-port(8080)",
                "start(new)",
                "open-port(9090)",
                "start(web)",
            ]
        );
    }

    #[test]
    fn test_plans_are_deterministic() {
        let desired = deployment("h1", vec![app("c", "x"), app("a", "x"), app("b", "x")]);
        let current = deployment("h1", vec![app("z", "x"), app("y", "x")]);
        let first = calculate_changes(&desired, &current, "h1");
        assert_eq!(first, calculate_changes(&desired, &current, "h1"));
        assert_eq!(
            names(&first),
            ["stop(y)", "stop(z)", "start(a)", "start(b)", "start(c)"]
        );
    }

    #[tokio::test]
    async fn test_one_application_converges() {
        let h = harness("h1");
        h.runtime
            .create(&app("stale", "busybox"))
            .await
            .unwrap();
        h.runtime.create(&app("web", "nginx:1")).await.unwrap();

        let desired = deployment(
            "h1",
            vec![
                app("web", "nginx:2").with_ports([PortMap::new(80, 8080)]),
                app("db", "postgres:16").with_volume(AttachedVolume::new("db", "/data").unwrap()),
            ],
        );
        let current = Deployment::empty().with_node(h.deployer.discover_node_state().await.unwrap().node);

        let outcome = h
            .deployer
            .change_node_state(&desired, &current, &no_shutdown())
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Completed { .. }));

        let observed = h.deployer.discover_node_state().await.unwrap();
        assert_eq!(Some(&observed.node), desired.node("h1"));
        assert!(observed.used_ports.contains(&8080));
        assert!(h.volumes.attached().await.contains_key("db"));

        // Converged state yields an empty plan.
        let current = Deployment::empty().with_node(observed.node);
        assert!(h.deployer.calculate_changes(&desired, &current).is_empty());
    }

    #[tokio::test]
    async fn test_reapplying_a_partial_plan_is_harmless() {
        let h = harness("h1");
        let desired = deployment(
            "h1",
            vec![app("db", "postgres").with_volume(AttachedVolume::new("db-vol", "/data").unwrap())],
        );
        let changes = h.deployer.calculate_changes(&desired, &Deployment::empty());

        // Apply the whole plan twice, as if a crash had hidden the first run.
        h.deployer.apply_changes(&changes, &no_shutdown()).await.unwrap();
        h.deployer.apply_changes(&changes, &no_shutdown()).await.unwrap();

        assert_eq!(h.runtime.units().await.len(), 1);
        assert_eq!(h.network.open_ports().await.len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_honoured_between_changes() {
        let h = harness("h1");
        let desired = deployment("h1", vec![app("a", "x"), app("b", "x")]);
        let changes = h.deployer.calculate_changes(&desired, &Deployment::empty());

        let (_tx, shutdown) = watch::channel(true);
        let outcome = h.deployer.apply_changes(&changes, &shutdown).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Interrupted { applied: 0 });
        assert!(h.runtime.units().await.is_empty());
    }

    struct FailingCreate {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for FailingCreate {
        async fn list_units(&self) -> Result<Vec<Unit>, RuntimeError> {
            Ok(Vec::new())
        }

        async fn create(&self, _application: &Application) -> Result<(), RuntimeError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::Other("image pull failed".into()))
        }

        async fn remove(&self, _name: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_failure_abandons_the_plan() {
        let runtime = Arc::new(FailingCreate {
            creates: AtomicUsize::new(0),
        });
        let platform = Platform {
            backend: crate::platform::Backend::Memory,
            runtime: runtime.clone(),
            volumes: Arc::new(MemoryVolumes::new()),
            network: Arc::new(MemoryNetwork::default()),
        };
        let deployer = Deployer::new("h1", platform);
        let desired = deployment("h1", vec![app("a", "x"), app("b", "x")]);

        let err = deployer
            .change_node_state(&desired, &Deployment::empty(), &no_shutdown())
            .await
            .unwrap_err();
        assert_eq!(err.change.to_string(), "start(a)");
        assert_eq!(runtime.creates.load(Ordering::SeqCst), 1);
    }

    fn is_stop(change: &Change) -> bool {
        matches!(
            change,
            Change::StopApplication { .. } | Change::DetachVolume { .. } | Change::ClosePort { .. }
        )
    }

    proptest! {
        #[test]
        fn property_unchanged_node_needs_no_changes(
            deployment in testing::deployment(),
            hostname in testing::hostname()
        ) {
            prop_assert!(calculate_changes(&deployment, &deployment, &hostname).is_empty());
        }

        #[test]
        fn property_every_stop_precedes_every_start(
            desired in testing::desired_deployment(),
            current in testing::deployment(),
            hostname in testing::hostname()
        ) {
            let changes = calculate_changes(&desired, &current, &hostname);
            let last_stop = changes.iter().rposition(is_stop);
            let first_start = changes.iter().position(|c| !is_stop(c));
            if let (Some(last_stop), Some(first_start)) = (last_stop, first_start) {
                prop_assert!(last_stop < first_start, "{:?}", names(&changes));
            }
        }

        #[test]
        fn property_applying_the_plan_converges(
            desired in testing::desired_deployment(),
            current in testing::deployment(),
            hostname in testing::hostname()
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async {
                let h = harness(&hostname);
                let before = current.node_or_empty(&hostname);
                for application in before.applications() {
                    h.runtime.create(application).await.expect("seed unit");
                }

                let observed = h.deployer.discover_node_state().await.expect("discover");
                prop_assert_eq!(&observed.node, &before);

                let plan = h
                    .deployer
                    .calculate_changes(&desired, &current.with_node(observed.node));
                let outcome = h
                    .deployer
                    .apply_changes(&plan, &no_shutdown())
                    .await
                    .expect("apply");
                prop_assert_eq!(outcome, ApplyOutcome::Completed { applied: plan.len() });

                let after = h.deployer.discover_node_state().await.expect("rediscover");
                prop_assert_eq!(after.node, desired.node_or_empty(&hostname));
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
