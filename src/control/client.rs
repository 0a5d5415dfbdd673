//! Agent side of the control service.

use async_trait::async_trait;
use log::debug;
use reqwest::Response;

use crate::cluster::ClusterState;
use crate::document;
use crate::error::StoreError;
use crate::model::{Deployment, NodeState};
use crate::store::ConfigurationStore;

/// Talks to a control service over HTTP.  Serves agents both as their
/// configuration store and as their view of the cluster.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(StoreError::Rejected(text))
        } else {
            Err(StoreError::Unavailable(format!("{}: {}", status, text)))
        }
    }
}

#[async_trait]
impl ConfigurationStore for ControlClient {
    async fn get_config(&self) -> Result<Vec<u8>, StoreError> {
        let response = self.client.get(self.url("/v1/configuration")).send().await?;
        let blob = Self::check(response).await?.bytes().await?;
        Ok(blob.to_vec())
    }

    async fn set_config(&self, config: Vec<u8>) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url("/v1/configuration"))
            .body(config)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterState for ControlClient {
    async fn current(&self) -> Result<Deployment, StoreError> {
        let response = self.client.get(self.url("/v1/state")).send().await?;
        let text = Self::check(response).await?.text().await?;
        document::parse_cluster_state(&text).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    async fn publish(&self, state: &NodeState) -> Result<(), StoreError> {
        let body = document::encode_node_state(state)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let response = self
            .client
            .put(self.url(&format!("/v1/state/{}", state.hostname())))
            .body(body)
            .send()
            .await?;
        Self::check(response).await?;
        debug!("Published state of {}", state.hostname());
        Ok(())
    }
}
