//! Network collaborators: which ports are in use on the host, and opening
//! or closing external ports for applications.

use std::collections::BTreeSet;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::RuntimeError;

#[async_trait]
pub trait Network: Send + Sync {
    async fn used_ports(&self) -> Result<BTreeSet<u16>, RuntimeError>;
    async fn open_port(&self, port: u16) -> Result<(), RuntimeError>;
    async fn close_port(&self, port: u16) -> Result<(), RuntimeError>;
}

/// TCP state code for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

const RULE_COMMENT: &str = "converged";

/// Ports listening on this host, read from `/proc/net`, with firewall rules
/// managed through `iptables`.
#[derive(Debug, Default)]
pub struct HostNetwork;

impl HostNetwork {
    pub fn new() -> Self {
        Self
    }

    fn rule(action: &str, port: u16) -> Vec<String> {
        [
            action,
            "INPUT",
            "-p",
            "tcp",
            "--dport",
            &port.to_string(),
            "-m",
            "comment",
            "--comment",
            RULE_COMMENT,
            "-j",
            "ACCEPT",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Run an `iptables -C` check: `true` when the rule exists.
    async fn iptables(args: &[String]) -> Result<bool, RuntimeError> {
        let output = Command::new("iptables").args(args).output().await?;
        rule_present(args, output.status.code(), &output.stderr)
    }

    async fn iptables_checked(args: &[String]) -> Result<(), RuntimeError> {
        let output = Command::new("iptables").args(args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        Err(RuntimeError::Command {
            command: format!("iptables {}", args.join(" ")),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Interpret the exit code of `iptables -C`.  Only 1 means the rule is
/// missing; any other failure is an error.
fn rule_present(args: &[String], code: Option<i32>, stderr: &[u8]) -> Result<bool, RuntimeError> {
    match code {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        other => Err(RuntimeError::Command {
            command: format!("iptables {}", args.join(" ")),
            message: match String::from_utf8_lossy(stderr).trim() {
                "" => match other {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                },
                message => message.to_string(),
            },
        }),
    }
}

/// Local ports in LISTEN state from the contents of `/proc/net/tcp` or
/// `/proc/net/tcp6`.
pub fn parse_listening_ports(table: &str) -> BTreeSet<u16> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            if *state != TCP_LISTEN {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

#[async_trait]
impl Network for HostNetwork {
    async fn used_ports(&self) -> Result<BTreeSet<u16>, RuntimeError> {
        let mut ports = BTreeSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match tokio::fs::read_to_string(table).await {
                Ok(contents) => ports.extend(parse_listening_ports(&contents)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} not present", table)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ports)
    }

    async fn open_port(&self, port: u16) -> Result<(), RuntimeError> {
        if Self::iptables(&Self::rule("-C", port)).await? {
            debug!("Port {} already open", port);
            return Ok(());
        }
        Self::iptables_checked(&Self::rule("-A", port)).await?;
        info!("Opened port {}", port);
        Ok(())
    }

    async fn close_port(&self, port: u16) -> Result<(), RuntimeError> {
        if !Self::iptables(&Self::rule("-C", port)).await? {
            debug!("Port {} already closed", port);
            return Ok(());
        }
        Self::iptables_checked(&Self::rule("-D", port)).await?;
        info!("Closed port {}", port);
        Ok(())
    }
}

/// Network state kept in memory.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    used: Mutex<BTreeSet<u16>>,
    open: Mutex<BTreeSet<u16>>,
}

impl MemoryNetwork {
    pub fn new(used_ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            used: Mutex::new(used_ports.into_iter().collect()),
            open: Mutex::new(BTreeSet::new()),
        }
    }

    pub async fn open_ports(&self) -> BTreeSet<u16> {
        self.open.lock().await.clone()
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn used_ports(&self) -> Result<BTreeSet<u16>, RuntimeError> {
        let used = self.used.lock().await.clone();
        let open = self.open.lock().await.clone();
        Ok(used.union(&open).copied().collect())
    }

    async fn open_port(&self, port: u16) -> Result<(), RuntimeError> {
        self.open.lock().await.insert(port);
        Ok(())
    }

    async fn close_port(&self, port: u16) -> Result<(), RuntimeError> {
        self.open.lock().await.remove(&port);
        Ok(())
    }
}
