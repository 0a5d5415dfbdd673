//! Error types for converged.
//!
//! Errors are split by where they arise.  Pure computations (model
//! construction, document decoding) return [`ValidationError`],
//! [`ParseError`] or [`ConfigurationError`] and are surfaced straight to
//! the operator.  I/O against collaborators returns [`RuntimeError`],
//! which the agent wraps into [`DiscoveryError`] or [`ActionError`]
//! depending on the phase, and contains rather than propagates.

use thiserror::Error;

use crate::deploy::Change;

/// A domain value could not be constructed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Node {hostname} has duplicate application name: {name}")]
    DuplicateApplication { hostname: String, name: String },

    #[error("Deployment has duplicate node hostname: {0}")]
    DuplicateNode(String),

    #[error("Volume mountpoint must be an absolute path: {0}")]
    RelativeMountpoint(String),

    #[error("Non-ASCII hostname: {0}")]
    NonAsciiHostname(String),
}

/// A serialized value could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid image reference: {0:?}")]
    ImageReference(String),

    #[error("{kind} config could not be parsed as YAML:\n\n{message}")]
    Yaml { kind: &'static str, message: String },
}

/// A configuration document was syntactically valid but semantically wrong,
/// or could not be parsed at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Configuration Error: {0}")]
    Invalid(String),

    #[error("Configuration Error: {0}")]
    Validation(#[from] ValidationError),
}

/// A collaborator (container runtime, volume manager, network) failed.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// The current state of this node could not be observed.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Container runtime unreachable: {0}")]
    Runtime(#[source] RuntimeError),

    #[error("Network state unavailable: {0}")]
    Network(#[source] RuntimeError),

    #[error("Unit {unit} reports an invalid image: {source}")]
    Image {
        unit: String,
        #[source]
        source: ParseError,
    },

    #[error("Runtime reported inconsistent units: {0}")]
    Validation(#[from] ValidationError),
}

/// A single change could not be applied.  The rest of the plan it belonged
/// to is abandoned.
#[derive(Error, Debug)]
#[error("Failed to apply {change}: {source}")]
pub struct ActionError {
    pub change: Change,
    #[source]
    pub source: RuntimeError,
}

/// The configuration store backend failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Configuration store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request outright, e.g. a control service
    /// rejecting an invalid configuration.
    #[error("Configuration store rejected the request: {0}")]
    Rejected(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
