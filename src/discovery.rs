//! Observing the current state of one node.

use log::debug;

use crate::error::DiscoveryError;
use crate::model::{Node, NodeState};
use crate::network::Network;
use crate::runtime::ContainerRuntime;

/// Build a snapshot of what is running on `hostname`.
///
/// Discovery only reads.  A failure means the state is unknown this time
/// round, which callers must not confuse with an empty node.
pub async fn discover_node_state(
    runtime: &dyn ContainerRuntime,
    network: &dyn Network,
    hostname: &str,
) -> Result<NodeState, DiscoveryError> {
    let units = runtime.list_units().await.map_err(DiscoveryError::Runtime)?;

    let applications = units
        .iter()
        .map(|unit| {
            unit.to_application().map_err(|source| DiscoveryError::Image {
                unit: unit.name.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let used_ports = network.used_ports().await.map_err(DiscoveryError::Network)?;
    debug!(
        "Discovered {} units and {} used ports on {}",
        applications.len(),
        used_ports.len(),
        hostname
    );

    Ok(NodeState {
        node: Node::new(hostname, applications)?,
        used_ports,
    })
}
