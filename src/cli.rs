//! Command-line entry points.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

use crate::agent::{watch_configuration, Agent};
use crate::cluster::MemoryClusterState;
use crate::config::Config;
use crate::control::{ControlClient, ControlService};
use crate::deploy::{ApplyOutcome, Deployer};
use crate::document;
use crate::model::{validate_hostname, Deployment};
use crate::platform::Platform;
use crate::store::{ConfigurationStore, FileStore};

#[derive(Debug, Parser)]
#[command(name = "converged", version, about = "Converge container nodes onto a desired configuration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control service
    Serve {
        /// Port to listen on, overriding the configured address's port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the convergence agent for this node
    Agent,
    /// Print the current state of this node as YAML
    ReportState,
    /// Converge this node once from documents given on the command line
    ChangeState(ChangeStateArgs),
    /// Validate a configuration and hand it to the control service
    Deploy {
        /// Deployment document
        deployment: PathBuf,
        /// Application document
        application: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ChangeStateArgs {
    /// Deployment document
    pub deployment: String,
    /// Application document
    pub application: String,
    /// Cluster state document
    pub current: String,
    /// Node to converge
    pub hostname: String,
}

/// The parsed arguments of `change-state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeState {
    pub desired: Deployment,
    pub current: Deployment,
    pub hostname: String,
}

impl ChangeStateArgs {
    pub fn parse_documents(&self) -> anyhow::Result<ChangeState> {
        validate_hostname(&self.hostname)?;
        let (desired, current) =
            document::parse_change_state(&self.deployment, &self.application, &self.current)?;
        Ok(ChangeState {
            desired,
            current,
            hostname: self.hostname.clone(),
        })
    }
}

pub async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { port } => serve(&config, port).await,
        Command::Agent => agent(&config).await,
        Command::ReportState => report_state(&config).await,
        Command::ChangeState(args) => change_state(&config, &args).await,
        Command::Deploy {
            deployment,
            application,
        } => deploy(&config, &deployment, &application).await,
    }
}

async fn wait_for_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }
}

async fn serve(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    let mut listen = config.listen;
    if let Some(port) = port {
        listen.set_port(port);
    }

    let store = Arc::new(FileStore::new(config.configuration_path()));
    info!("Storing configuration in {}", store.path().display());
    let service = ControlService::new(store, Arc::new(MemoryClusterState::new()));

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    let (shutdown_tx, shutdown) = watch::channel(false);
    let server = tokio::spawn(service.serve(listener, shutdown));

    wait_for_signal().await;
    shutdown_tx.send_replace(true);
    server.await??;

    info!("Shutdown complete.");
    Ok(())
}

async fn agent(config: &Config) -> anyhow::Result<()> {
    let hostname = config.hostname()?;
    let platform = Platform::from_config(config, &hostname)?;
    let client = Arc::new(ControlClient::new(config.control_url.clone()));
    info!("Agent for {} using control service {}", hostname, client.base_url());

    let agent = Agent::new(
        Deployer::new(hostname, platform.clone()),
        client.clone(),
        client.clone(),
        config.agent_settings(),
    );
    let trigger = agent.trigger_handle();
    let (shutdown_tx, shutdown) = watch::channel(false);

    let poller = tokio::spawn(watch_configuration(
        client,
        trigger.clone(),
        agent.settings().poll,
        shutdown.clone(),
    ));

    let runtime = platform.runtime.clone();
    let events = tokio::spawn(async move {
        if let Err(e) = runtime.watch(trigger).await {
            warn!("Runtime events unavailable: {}", e);
        }
    });

    let agent_handle = tokio::spawn(agent.run(shutdown));

    wait_for_signal().await;
    shutdown_tx.send_replace(true);

    // Let any change in progress finish before exiting.
    agent_handle.await?;
    poller.await?;
    events.abort();

    info!("Shutdown complete.");
    Ok(())
}

/// The node state document for whatever `deployer` finds on its node.
pub async fn node_state_document(deployer: &Deployer) -> anyhow::Result<String> {
    let state = deployer.discover_node_state().await?;
    Ok(document::encode_node_state(&state)?)
}

async fn report_state(config: &Config) -> anyhow::Result<()> {
    let hostname = config.hostname()?;
    let platform = Platform::from_config(config, &hostname)?;
    let text = node_state_document(&Deployer::new(hostname, platform)).await?;
    print!("{}", text);
    Ok(())
}

/// Converge the deployer's node once.  Returns the number of changes made.
pub async fn apply_change_state(deployer: &Deployer, change: &ChangeState) -> anyhow::Result<usize> {
    let local = deployer.discover_node_state().await?;
    let current = change.current.with_node(local.node);
    let (_never, shutdown) = watch::channel(false);
    match deployer
        .change_node_state(&change.desired, &current, &shutdown)
        .await?
    {
        ApplyOutcome::Completed { applied } => Ok(applied),
        ApplyOutcome::Interrupted { applied } => {
            anyhow::bail!("Interrupted after {} changes", applied)
        }
    }
}

async fn change_state(config: &Config, args: &ChangeStateArgs) -> anyhow::Result<()> {
    let change = args.parse_documents()?;
    let platform = Platform::from_config(config, &change.hostname)?;
    let deployer = Deployer::new(change.hostname.clone(), platform);
    let applied = apply_change_state(&deployer, &change).await?;
    info!("Applied {} changes on {}", applied, change.hostname);
    Ok(())
}

async fn deploy(
    config: &Config,
    deployment: &Path,
    application: &Path,
) -> anyhow::Result<()> {
    let deployment_text = tokio::fs::read_to_string(deployment)
        .await
        .with_context(|| format!("Failed to read {}", deployment.display()))?;
    let application_text = tokio::fs::read_to_string(application)
        .await
        .with_context(|| format!("Failed to read {}", application.display()))?;

    let desired = document::parse_configuration(&deployment_text, &application_text)?;
    let blob = document::encode_deployment(&desired)?;
    ControlClient::new(config.control_url.clone())
        .set_config(blob.into_bytes())
        .await?;
    info!("Deployment of {} nodes sent to {}", desired.nodes().count(), config.control_url);
    Ok(())
}
