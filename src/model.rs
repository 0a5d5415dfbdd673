//! Domain model shared by the engine, discovery and the documents.
//!
//! Every type here is a plain value: equality and hashing are structural,
//! and "changing" a value means building a new one.  The same
//! [`Deployment`] type describes both the desired configuration and an
//! observed cluster snapshot; callers keep track of which role a value
//! plays.  Collections are ordered so that iteration, and therefore every
//! plan derived from these values, is deterministic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ParseError, ValidationError};

/// Tag assumed when an image reference does not name one.
pub const DEFAULT_TAG: &str = "latest";

/// A container image reference, `repository:tag`.
///
/// Only references that render back to themselves can be built, so
/// `to_string().parse()` always returns an equal image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DockerImage {
    repository: String,
    tag: String,
}

impl DockerImage {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Result<Self, ParseError> {
        let image = Self {
            repository: repository.into(),
            tag: tag.into(),
        };
        let rendered = image.to_string();
        match Self::parse(&rendered) {
            Ok(parsed) if parsed == image => Ok(image),
            _ => Err(ParseError::ImageReference(rendered)),
        }
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Parse a `repository[:tag]` reference.
    ///
    /// A colon only separates a tag when nothing after it contains a `/`,
    /// so `registry:5000/app` is a repository on a registry with a port,
    /// not repository `registry` with tag `5000/app`.
    pub fn parse(reference: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::ImageReference(reference.to_string());

        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (repository, tag) = match reference.rfind(':') {
            Some(idx) if !reference[idx + 1..].contains('/') => {
                (&reference[..idx], &reference[idx + 1..])
            }
            _ => (reference, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl FromStr for DockerImage {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortMap {
    pub internal_port: u16,
    pub external_port: u16,
}

impl PortMap {
    pub fn new(internal_port: u16, external_port: u16) -> Self {
        Self {
            internal_port,
            external_port,
        }
    }
}

/// A link from an application to a service reachable on another port.
///
/// Links are exposed to the container as Docker-link style environment
/// variables named after `alias`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Link {
    pub local_port: u16,
    pub remote_port: u16,
    pub alias: String,
}

/// What the runtime should do when an application's container exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    OnFailure {
        maximum_retry_count: Option<NonZeroU32>,
    },
}

impl RestartPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "never",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure { .. } => "on-failure",
        }
    }
}

/// A named data volume mounted into an application's container.
///
/// `name` identifies the underlying volume on every node; `mountpoint` is
/// where it appears inside the container and is always absolute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttachedVolume {
    name: String,
    mountpoint: PathBuf,
}

impl AttachedVolume {
    pub fn new(
        name: impl Into<String>,
        mountpoint: impl Into<PathBuf>,
    ) -> Result<Self, ValidationError> {
        let mountpoint = mountpoint.into();
        if !mountpoint.is_absolute() {
            return Err(ValidationError::RelativeMountpoint(
                mountpoint.display().to_string(),
            ));
        }
        Ok(Self {
            name: name.into(),
            mountpoint,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

/// A containerized application.
///
/// `name` is the identity used when diffing: two applications with the
/// same name and different values are one application in two
/// configurations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Application {
    pub name: String,
    pub image: DockerImage,
    pub ports: BTreeSet<PortMap>,
    pub links: BTreeSet<Link>,
    pub volume: Option<AttachedVolume>,
    pub restart_policy: RestartPolicy,
    pub running: bool,
}

impl Application {
    /// A running application with no ports, links or volume.
    pub fn new(name: impl Into<String>, image: DockerImage) -> Self {
        Self {
            name: name.into(),
            image,
            ports: BTreeSet::new(),
            links: BTreeSet::new(),
            volume: None,
            restart_policy: RestartPolicy::Never,
            running: true,
        }
    }

    pub fn with_image(self, image: DockerImage) -> Self {
        Self { image, ..self }
    }

    pub fn with_ports(self, ports: impl IntoIterator<Item = PortMap>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
            ..self
        }
    }

    pub fn with_links(self, links: impl IntoIterator<Item = Link>) -> Self {
        Self {
            links: links.into_iter().collect(),
            ..self
        }
    }

    pub fn with_volume(self, volume: AttachedVolume) -> Self {
        Self {
            volume: Some(volume),
            ..self
        }
    }

    pub fn with_restart_policy(self, restart_policy: RestartPolicy) -> Self {
        Self {
            restart_policy,
            ..self
        }
    }

    pub fn with_running(self, running: bool) -> Self {
        Self { running, ..self }
    }
}

/// Hostnames name nodes in documents and URLs and must be plain ASCII.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    if !hostname.is_ascii() {
        return Err(ValidationError::NonAsciiHostname(hostname.to_string()));
    }
    Ok(())
}

/// The applications placed on one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Node {
    hostname: String,
    applications: BTreeMap<String, Application>,
}

impl Node {
    /// Build a node, rejecting two applications with the same name.
    pub fn new(
        hostname: impl Into<String>,
        applications: impl IntoIterator<Item = Application>,
    ) -> Result<Self, ValidationError> {
        let hostname = hostname.into();
        let mut by_name = BTreeMap::new();
        for application in applications {
            if by_name.contains_key(&application.name) {
                return Err(ValidationError::DuplicateApplication {
                    hostname,
                    name: application.name,
                });
            }
            by_name.insert(application.name.clone(), application);
        }
        Ok(Self {
            hostname,
            applications: by_name,
        })
    }

    pub fn empty(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            applications: BTreeMap::new(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Applications in name order.
    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.applications.values()
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

/// A whole-cluster configuration: at most one node per hostname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Deployment {
    nodes: BTreeMap<String, Node>,
}

impl Deployment {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Result<Self, ValidationError> {
        let mut by_hostname = BTreeMap::new();
        for node in nodes {
            if by_hostname.contains_key(node.hostname()) {
                return Err(ValidationError::DuplicateNode(node.hostname));
            }
            by_hostname.insert(node.hostname.clone(), node);
        }
        Ok(Self { nodes: by_hostname })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Nodes in hostname order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node(&self, hostname: &str) -> Option<&Node> {
        self.nodes.get(hostname)
    }

    /// The node for `hostname`, or an empty one if the deployment has none.
    pub fn node_or_empty(&self, hostname: &str) -> Node {
        self.node(hostname)
            .cloned()
            .unwrap_or_else(|| Node::empty(hostname))
    }

    /// A copy of this deployment with `node` replacing any node of the same
    /// hostname.
    pub fn with_node(&self, node: Node) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.insert(node.hostname.clone(), node);
        Self { nodes }
    }
}

/// What discovery observed on one host.
///
/// Used ports are reported for the host as a whole because the runtime
/// cannot reliably say which application owns which port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub node: Node,
    pub used_ports: BTreeSet<u16>,
}

impl NodeState {
    pub fn hostname(&self) -> &str {
        self.node.hostname()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn nginx(tag: &str) -> DockerImage {
        DockerImage::new("nginx", tag).unwrap()
    }

    #[test]
    fn test_hostnames_must_be_ascii() {
        assert!(validate_hostname("node-1.example.com").is_ok());
        assert_eq!(
            validate_hostname("nöde").unwrap_err().to_string(),
            "Non-ASCII hostname: nöde"
        );
    }

    #[test]
    fn test_parse_image_without_tag() {
        assert_eq!(
            DockerImage::parse("x/y").unwrap(),
            DockerImage::new("x/y", "latest").unwrap()
        );
    }

    #[test]
    fn test_parse_image_with_tag() {
        assert_eq!(
            DockerImage::parse("x/y:1.2").unwrap(),
            DockerImage::new("x/y", "1.2").unwrap()
        );
    }

    #[test]
    fn test_parse_image_with_registry_port() {
        let image = DockerImage::parse("registry:5000/app").unwrap();
        assert_eq!(image, DockerImage::new("registry:5000/app", "latest").unwrap());

        let image = DockerImage::parse("registry:5000/app:3").unwrap();
        assert_eq!(image, DockerImage::new("registry:5000/app", "3").unwrap());
    }

    #[test]
    fn test_parse_image_rejects_malformed() {
        for bad in ["", ":", "x:", ":tag", "has space:1"] {
            assert!(
                matches!(DockerImage::parse(bad), Err(ParseError::ImageReference(_))),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_image_display_round_trips() {
        for reference in ["clusterhq/wordpress:latest", "x/y:1.2", "registry:5000/app:3"] {
            let image: DockerImage = reference.parse().unwrap();
            assert_eq!(image.to_string(), reference);
            assert_eq!(image.to_string().parse::<DockerImage>().unwrap(), image);
        }
    }

    #[test]
    fn test_new_image_must_survive_rendering() {
        let image = DockerImage::new("registry:5000/app", "3").unwrap();
        assert_eq!(image.repository(), "registry:5000/app");
        assert_eq!(image.tag(), "3");

        for (repository, tag) in [("a", "b/c"), ("", "latest"), ("nginx", ""), ("a b", "1"), ("a", "1:2")] {
            assert!(
                matches!(DockerImage::new(repository, tag), Err(ParseError::ImageReference(_))),
                "{repository:?}:{tag:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_volume_requires_absolute_mountpoint() {
        assert!(AttachedVolume::new("data", "/var/lib/data").is_ok());
        assert_eq!(
            AttachedVolume::new("data", "var/lib/data"),
            Err(ValidationError::RelativeMountpoint("var/lib/data".into()))
        );
    }

    #[test]
    fn test_node_rejects_duplicate_application_names() {
        let result = Node::new(
            "node1.example.com",
            [
                Application::new("web", nginx("1")),
                Application::new("web", nginx("2")),
            ],
        );
        assert_eq!(
            result,
            Err(ValidationError::DuplicateApplication {
                hostname: "node1.example.com".into(),
                name: "web".into(),
            })
        );
    }

    #[test]
    fn test_deployment_rejects_duplicate_hostnames() {
        let result = Deployment::new([Node::empty("h1"), Node::empty("h1")]);
        assert_eq!(result, Err(ValidationError::DuplicateNode("h1".into())));
    }

    #[test]
    fn test_structural_equality_and_hashing() {
        let a = Node::new("h1", [Application::new("web", nginx("1"))]).unwrap();
        let b = Node::new("h1", [Application::new("web", nginx("1"))]).unwrap();
        let c = Node::new("h1", [Application::new("web", nginx("2"))]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Node> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_with_node_leaves_original_untouched() {
        let original = Deployment::new([Node::empty("h1")]).unwrap();
        let web = Node::new("h1", [Application::new("web", nginx("1"))]).unwrap();
        let updated = original.with_node(web.clone());

        assert!(original.node("h1").unwrap().is_empty());
        assert_eq!(updated.node("h1"), Some(&web));
    }

    #[test]
    fn test_node_or_empty_defaults() {
        let deployment = Deployment::empty();
        assert_eq!(deployment.node_or_empty("h9"), Node::empty("h9"));
    }
}
