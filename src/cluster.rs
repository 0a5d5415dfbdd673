//! The cluster-wide view of current state, assembled from what each node
//! reports about itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{Deployment, NodeState};

#[async_trait]
pub trait ClusterState: Send + Sync {
    /// The most recent report of every node that has reported.
    async fn current(&self) -> Result<Deployment, StoreError>;

    /// Replace the report for `state`'s node.
    async fn publish(&self, state: &NodeState) -> Result<(), StoreError>;
}

/// Node reports kept in memory, newest report per hostname.
#[derive(Debug, Default)]
pub struct MemoryClusterState {
    states: RwLock<BTreeMap<String, NodeState>>,
}

impl MemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn states(&self) -> Vec<NodeState> {
        self.states.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ClusterState for MemoryClusterState {
    async fn current(&self) -> Result<Deployment, StoreError> {
        let states = self.states.read().await;
        Ok(states
            .values()
            .fold(Deployment::empty(), |deployment, state| {
                deployment.with_node(state.node.clone())
            }))
    }

    async fn publish(&self, state: &NodeState) -> Result<(), StoreError> {
        debug!("Recording state of {}", state.hostname());
        self.states
            .write()
            .await
            .insert(state.hostname().to_string(), state.clone());
        Ok(())
    }
}
