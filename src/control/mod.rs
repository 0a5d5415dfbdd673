//! HTTP control service.
//!
//! Holds the desired configuration on behalf of the cluster and collects the
//! state each agent reports about its node.
//!
//! | Method | Path                   | Body                   |
//! |--------|------------------------|------------------------|
//! | GET    | `/v1/configuration`    | stored deployment      |
//! | PUT    | `/v1/configuration`    | deployment to store    |
//! | GET    | `/v1/state`            | cluster state document |
//! | PUT    | `/v1/state/{hostname}` | node state document    |

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cluster::{ClusterState, MemoryClusterState};
use crate::document;
use crate::store::ConfigurationStore;

pub mod client;

pub use client::ControlClient;

pub const DEFAULT_PORT: u16 = 4523;

const YAML: &str = "application/yaml";

#[derive(Clone)]
pub struct ControlService {
    store: Arc<dyn ConfigurationStore>,
    cluster: Arc<MemoryClusterState>,
}

fn yaml(body: impl Into<axum::body::Body>) -> Response {
    ([(header::CONTENT_TYPE, YAML)], body.into()).into_response()
}

fn failure(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}

impl ControlService {
    pub fn new(store: Arc<dyn ConfigurationStore>, cluster: Arc<MemoryClusterState>) -> Self {
        Self { store, cluster }
    }

    async fn get_configuration(State(service): State<ControlService>) -> Response {
        match service.store.get_config().await {
            Ok(blob) => yaml(blob),
            Err(e) => failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }

    async fn put_configuration(State(service): State<ControlService>, body: Bytes) -> Response {
        if let Err(e) = document::decode_deployment(&body) {
            warn!("Rejected configuration: {}", e);
            return failure(StatusCode::BAD_REQUEST, e.to_string());
        }
        match service.store.set_config(body.to_vec()).await {
            Ok(()) => {
                info!("Stored new configuration ({} bytes)", body.len());
                StatusCode::NO_CONTENT.into_response()
            }
            Err(e) => failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }

    async fn get_state(State(service): State<ControlService>) -> Response {
        let states = service.cluster.states().await;
        match document::encode_cluster_state(&states) {
            Ok(text) => yaml(text),
            Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    async fn put_state(
        State(service): State<ControlService>,
        Path(hostname): Path<String>,
        body: String,
    ) -> Response {
        let state = match document::parse_node_state(&hostname, &body) {
            Ok(state) => state,
            Err(e) => return failure(StatusCode::BAD_REQUEST, e.to_string()),
        };
        match service.cluster.publish(&state).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(
                "/v1/configuration",
                get(Self::get_configuration).put(Self::put_configuration),
            )
            .route("/v1/state", get(Self::get_state))
            .route("/v1/state/{hostname}", put(Self::put_state))
            .with_state(self)
    }

    /// Serve requests on `listener` until `shutdown` turns true.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!("Control service listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    }
}
