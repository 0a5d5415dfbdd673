//! YAML documents describing desired configuration and observed state.
//!
//! Every document carries `version: 1`.  The shapes are:
//!
//! * application document: `{version, applications: {name: config}}`
//! * deployment document: `{version, nodes: {hostname: [application names]}}`
//! * node state document: an application document plus `used_ports`
//! * cluster state document: `{hostname: node state document}`
//! * deployment state document, the stored form of a [`Deployment`]:
//!   `{version, nodes: {hostname: {applications: {name: config}}}}`
//!
//! Decoding walks a [`serde_yaml::Value`] by hand so that every error names
//! exactly which part of which document was wrong.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;

use serde_yaml::{Mapping, Value};

use crate::error::{ConfigurationError, ParseError};
use crate::model::{
    Application, AttachedVolume, Deployment, DockerImage, Link, Node, NodeState, PortMap,
    RestartPolicy,
};

/// The only document version understood.
pub const VERSION: u64 = 1;

/// Keys an operator may give an application.
const APPLICATION_KEYS: &[&str] = &["image", "ports", "links", "volume", "restart_policy"];
/// Keys in documents describing observed or stored state, which also
/// record whether the application is running.
const STATE_KEYS: &[&str] = &["image", "ports", "links", "volume", "restart_policy", "running"];

fn invalid(message: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid(message.into())
}

fn load(kind: &'static str, text: &str) -> Result<Value, ParseError> {
    serde_yaml::from_str(text).map_err(|e| ParseError::Yaml {
        kind,
        message: e.to_string(),
    })
}

fn number(n: impl Into<u64>) -> Value {
    let n: u64 = n.into();
    Value::Number(n.into())
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => format!("{other:?}"),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// A missing document (`null`) behaves like an empty mapping.
fn as_mapping<'a>(value: &'a Value, empty: &'a Mapping) -> Option<&'a Mapping> {
    match value {
        Value::Mapping(map) => Some(map),
        Value::Null => Some(empty),
        _ => None,
    }
}

/// Check the top level of a versioned document and return the value under
/// `key`.
fn versioned<'a>(
    doc: &'a Value,
    what: &str,
    key: &str,
    empty: &'a Mapping,
) -> Result<&'a Value, ConfigurationError> {
    let map = as_mapping(doc, empty).ok_or_else(|| {
        invalid(format!(
            "{what} has an error. Expected a mapping, got {}.",
            type_name(doc)
        ))
    })?;
    let entries = map
        .get(key)
        .ok_or_else(|| invalid(format!("{what} has an error. Missing '{key}' key.")))?;
    match map.get("version") {
        None => Err(invalid(format!("{what} has an error. Missing 'version' key."))),
        Some(v) if v.as_u64() == Some(VERSION) => Ok(entries),
        Some(v) => Err(invalid(format!(
            "{what} has an error. Unsupported version: {}.",
            scalar(v)
        ))),
    }
}

fn port(value: &Value, field: &str) -> Result<u16, String> {
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| format!("'{field}' must be a port number, got {}.", scalar(value)))
}

fn decode_ports(value: &Value) -> Result<BTreeSet<PortMap>, String> {
    let entries = match value {
        Value::Sequence(entries) => entries,
        Value::Null => return Ok(BTreeSet::new()),
        other => return Err(format!("Invalid ports specification. Expected a list, got {}.", type_name(other))),
    };
    entries
        .iter()
        .map(|entry| -> Result<PortMap, String> {
            let internal = entry
                .get("internal")
                .ok_or("Invalid ports specification. Missing 'internal' key.")?;
            let external = entry
                .get("external")
                .ok_or("Invalid ports specification. Missing 'external' key.")?;
            Ok(PortMap::new(
                port(internal, "internal").map_err(|e| format!("Invalid ports specification. {e}"))?,
                port(external, "external").map_err(|e| format!("Invalid ports specification. {e}"))?,
            ))
        })
        .collect()
}

fn decode_links(value: &Value) -> Result<BTreeSet<Link>, String> {
    let entries = match value {
        Value::Sequence(entries) => entries,
        Value::Null => return Ok(BTreeSet::new()),
        other => return Err(format!("Invalid links specification. Expected a list, got {}.", type_name(other))),
    };
    entries
        .iter()
        .map(|entry| -> Result<Link, String> {
            let field = |key: &str| {
                entry
                    .get(key)
                    .ok_or_else(|| format!("Invalid links specification. Missing '{key}' key."))
            };
            let alias = field("alias")?
                .as_str()
                .ok_or("Invalid links specification. 'alias' must be a string.")?;
            Ok(Link {
                local_port: port(field("local_port")?, "local_port")
                    .map_err(|e| format!("Invalid links specification. {e}"))?,
                remote_port: port(field("remote_port")?, "remote_port")
                    .map_err(|e| format!("Invalid links specification. {e}"))?,
                alias: alias.to_string(),
            })
        })
        .collect()
}

fn decode_volume(application: &str, value: &Value) -> Result<AttachedVolume, String> {
    let map = value
        .as_mapping()
        .ok_or("Invalid volume specification. Expected a mapping.")?;
    for key in map.keys() {
        match key.as_str() {
            Some("mountpoint") | Some("name") => {}
            _ => {
                return Err(format!(
                    "Invalid volume specification. Unrecognised key: {}.",
                    scalar(key)
                ))
            }
        }
    }
    let mountpoint = map
        .get("mountpoint")
        .ok_or("Invalid volume specification. Missing 'mountpoint' key.")?
        .as_str()
        .ok_or("Invalid volume specification. 'mountpoint' must be a string.")?;
    let name = match map.get("name") {
        Some(name) => name
            .as_str()
            .ok_or("Invalid volume specification. 'name' must be a string.")?,
        None => application,
    };
    AttachedVolume::new(name, mountpoint).map_err(|e| format!("Invalid volume specification. {e}."))
}

fn decode_restart_policy(value: &Value) -> Result<RestartPolicy, String> {
    let map = value
        .as_mapping()
        .ok_or("Invalid restart policy. Expected a mapping.")?;
    for key in map.keys() {
        match key.as_str() {
            Some("name") | Some("maximum_retry_count") => {}
            _ => {
                return Err(format!(
                    "Invalid restart policy. Unrecognised key: {}.",
                    scalar(key)
                ))
            }
        }
    }
    let name = map
        .get("name")
        .and_then(Value::as_str)
        .ok_or("Invalid restart policy. Missing 'name' key.")?;
    let retries = map.get("maximum_retry_count");
    match (name, retries) {
        ("never", None) => Ok(RestartPolicy::Never),
        ("always", None) => Ok(RestartPolicy::Always),
        ("on-failure", None) => Ok(RestartPolicy::OnFailure {
            maximum_retry_count: None,
        }),
        ("on-failure", Some(count)) => {
            let count = count
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .and_then(NonZeroU32::new)
                .ok_or("Invalid restart policy. 'maximum_retry_count' must be a positive integer.")?;
            Ok(RestartPolicy::OnFailure {
                maximum_retry_count: Some(count),
            })
        }
        ("never", Some(_)) | ("always", Some(_)) => Err(format!(
            "Invalid restart policy. 'maximum_retry_count' is only valid with 'on-failure', not '{name}'."
        )),
        (other, _) => Err(format!("Invalid restart policy name: {other}.")),
    }
}

fn decode_application(
    name: &str,
    config: &Value,
    keys: &[&str],
) -> Result<Application, ConfigurationError> {
    let error = |detail: String| invalid(format!("Application '{name}' has a config error. {detail}"));

    let map = config
        .as_mapping()
        .ok_or_else(|| error(format!("Expected a mapping, got {}.", type_name(config))))?;

    let mut unknown: Vec<String> = map
        .keys()
        .map(scalar)
        .filter(|key| !keys.contains(&key.as_str()))
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(error(format!("Unrecognised keys: {}.", unknown.join(", "))));
    }

    let image = map
        .get("image")
        .ok_or_else(|| error("Missing value for 'image'.".into()))?
        .as_str()
        .ok_or_else(|| error("Invalid value for 'image'.".into()))?;
    let image = DockerImage::parse(image).map_err(|e| error(format!("Invalid Docker image name. {e}.")))?;

    let mut application = Application::new(name, image);
    if let Some(ports) = map.get("ports") {
        application = application.with_ports(decode_ports(ports).map_err(error)?);
    }
    if let Some(links) = map.get("links") {
        application = application.with_links(decode_links(links).map_err(error)?);
    }
    if let Some(volume) = map.get("volume") {
        application = application.with_volume(decode_volume(name, volume).map_err(error)?);
    }
    if let Some(policy) = map.get("restart_policy") {
        application = application.with_restart_policy(decode_restart_policy(policy).map_err(error)?);
    }
    if let Some(running) = map.get("running") {
        let running = running
            .as_bool()
            .ok_or_else(|| error("'running' must be true or false.".into()))?;
        application = application.with_running(running);
    }
    Ok(application)
}

fn decode_applications(
    entries: &Value,
    what: &str,
    keys: &[&str],
) -> Result<BTreeMap<String, Application>, ConfigurationError> {
    let empty = Mapping::new();
    let map = as_mapping(entries, &empty).ok_or_else(|| {
        invalid(format!(
            "{what} has an error. 'applications' must be a mapping, got {}.",
            type_name(entries)
        ))
    })?;
    let mut applications = BTreeMap::new();
    for (name, config) in map {
        let name = name.as_str().ok_or_else(|| {
            invalid(format!(
                "{what} has an error. Application names must be strings, got {}.",
                scalar(name)
            ))
        })?;
        applications.insert(name.to_string(), decode_application(name, config, keys)?);
    }
    Ok(applications)
}

fn encode_application(application: &Application) -> Value {
    let mut map = Mapping::new();
    map.insert("image".into(), application.image.to_string().into());

    if !application.ports.is_empty() {
        let ports = application
            .ports
            .iter()
            .map(|p| {
                let mut port = Mapping::new();
                port.insert("internal".into(), number(p.internal_port));
                port.insert("external".into(), number(p.external_port));
                Value::Mapping(port)
            })
            .collect();
        map.insert("ports".into(), Value::Sequence(ports));
    }

    if !application.links.is_empty() {
        let links = application
            .links
            .iter()
            .map(|l| {
                let mut link = Mapping::new();
                link.insert("local_port".into(), number(l.local_port));
                link.insert("remote_port".into(), number(l.remote_port));
                link.insert("alias".into(), l.alias.clone().into());
                Value::Mapping(link)
            })
            .collect();
        map.insert("links".into(), Value::Sequence(links));
    }

    if let Some(volume) = &application.volume {
        let mut v = Mapping::new();
        v.insert(
            "mountpoint".into(),
            volume.mountpoint().display().to_string().into(),
        );
        if volume.name() != application.name {
            v.insert("name".into(), volume.name().into());
        }
        map.insert("volume".into(), Value::Mapping(v));
    }

    let mut policy = Mapping::new();
    policy.insert("name".into(), application.restart_policy.name().into());
    if let RestartPolicy::OnFailure {
        maximum_retry_count: Some(count),
    } = application.restart_policy
    {
        policy.insert("maximum_retry_count".into(), number(count.get()));
    }
    map.insert("restart_policy".into(), Value::Mapping(policy));

    if !application.running {
        map.insert("running".into(), false.into());
    }
    Value::Mapping(map)
}

fn encode_applications<'a>(applications: impl Iterator<Item = &'a Application>) -> Value {
    let mut map = Mapping::new();
    for application in applications {
        map.insert(application.name.clone().into(), encode_application(application));
    }
    Value::Mapping(map)
}

/// Parse an application document into applications keyed by name.
pub fn parse_applications(text: &str) -> Result<BTreeMap<String, Application>, ConfigurationError> {
    let doc = load("Application", text)?;
    applications_from_document(&doc)
}

fn applications_from_document(doc: &Value) -> Result<BTreeMap<String, Application>, ConfigurationError> {
    let empty = Mapping::new();
    let entries = versioned(doc, "Application configuration", "applications", &empty)?;
    decode_applications(entries, "Application configuration", APPLICATION_KEYS)
}

/// Place `applications` onto nodes as described by a deployment document.
pub fn parse_deployment(
    text: &str,
    applications: &BTreeMap<String, Application>,
) -> Result<Deployment, ConfigurationError> {
    let doc = load("Deployment", text)?;
    deployment_from_document(&doc, applications)
}

fn deployment_from_document(
    doc: &Value,
    applications: &BTreeMap<String, Application>,
) -> Result<Deployment, ConfigurationError> {
    let empty = Mapping::new();
    let entries = versioned(doc, "Deployment configuration", "nodes", &empty)?;
    let nodes = as_mapping(entries, &empty).ok_or_else(|| {
        invalid(format!(
            "Deployment configuration has an error. 'nodes' must be a mapping, got {}.",
            type_name(entries)
        ))
    })?;

    let mut result = Vec::new();
    for (hostname, names) in nodes {
        let hostname = scalar(hostname);
        let error = |detail: String| invalid(format!("Node {hostname} has a config error. {detail}"));
        let names: &[Value] = match names {
            Value::Sequence(names) => names.as_slice(),
            Value::Null => &[],
            other => {
                return Err(error(format!(
                    "Wrong value type: {}. Should be list.",
                    type_name(other)
                )))
            }
        };
        let mut placed = Vec::new();
        for name in names {
            let name = scalar(name);
            let application = applications
                .get(&name)
                .ok_or_else(|| error(format!("Unrecognised application name: {name}.")))?;
            placed.push(application.clone());
        }
        result.push(Node::new(hostname.clone(), placed)?);
    }
    Ok(Deployment::new(result)?)
}

/// Parse the operator-facing pair of documents into a desired [`Deployment`].
///
/// Both documents are loaded before either is validated, so a syntax error
/// in either one is reported ahead of any configuration error.  The
/// deployment document's syntax is checked first.
pub fn parse_configuration(deployment: &str, applications: &str) -> Result<Deployment, ConfigurationError> {
    let deployment_doc = load("Deployment", deployment)?;
    let applications_doc = load("Application", applications)?;
    let applications = applications_from_document(&applications_doc)?;
    deployment_from_document(&deployment_doc, &applications)
}

/// Parse the three documents given to `change-state`: the desired
/// deployment and applications, and the current cluster state.
///
/// All three are loaded as YAML, in that order, before any of them is
/// validated.
pub fn parse_change_state(
    deployment: &str,
    applications: &str,
    current: &str,
) -> Result<(Deployment, Deployment), ConfigurationError> {
    let deployment_doc = load("Deployment", deployment)?;
    let applications_doc = load("Application", applications)?;
    let current_doc = load("Current", current)?;

    let applications = applications_from_document(&applications_doc)?;
    let desired = deployment_from_document(&deployment_doc, &applications)?;
    let current = cluster_state_from_document(&current_doc)?;
    Ok((desired, current))
}

fn node_state_from_value(hostname: &str, doc: &Value) -> Result<NodeState, ConfigurationError> {
    let what = format!("Node {hostname} state");
    let empty = Mapping::new();
    let entries = versioned(doc, &what, "applications", &empty)?;
    let applications = decode_applications(entries, &what, STATE_KEYS)?;

    let used_ports = match doc.get("used_ports") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Sequence(ports)) => ports
            .iter()
            .map(|p| port(p, "used_ports").map_err(|e| invalid(format!("{what} has an error. {e}"))))
            .collect::<Result<_, _>>()?,
        Some(other) => {
            return Err(invalid(format!(
                "{what} has an error. 'used_ports' must be a list, got {}.",
                type_name(other)
            )))
        }
    };

    Ok(NodeState {
        node: Node::new(hostname, applications.into_values())?,
        used_ports,
    })
}

/// Parse a node state document as reported by `hostname`.
pub fn parse_node_state(hostname: &str, text: &str) -> Result<NodeState, ConfigurationError> {
    let doc = load("Node state", text)?;
    node_state_from_value(hostname, &doc)
}

/// Parse a cluster state document into the current [`Deployment`].
pub fn parse_cluster_state(text: &str) -> Result<Deployment, ConfigurationError> {
    let doc = load("Current", text)?;
    cluster_state_from_document(&doc)
}

fn cluster_state_from_document(doc: &Value) -> Result<Deployment, ConfigurationError> {
    let empty = Mapping::new();
    let hosts = as_mapping(doc, &empty).ok_or_else(|| {
        invalid(format!(
            "Current configuration has an error. Expected a mapping, got {}.",
            type_name(doc)
        ))
    })?;
    let mut nodes = Vec::new();
    for (hostname, state) in hosts {
        nodes.push(node_state_from_value(&scalar(hostname), state)?.node);
    }
    Ok(Deployment::new(nodes)?)
}

fn node_state_value(state: &NodeState) -> Value {
    let mut map = Mapping::new();
    map.insert("version".into(), number(VERSION));
    map.insert("applications".into(), encode_applications(state.node.applications()));
    map.insert(
        "used_ports".into(),
        Value::Sequence(state.used_ports.iter().map(|p| number(*p)).collect()),
    );
    Value::Mapping(map)
}

/// Render a node state document.
pub fn encode_node_state(state: &NodeState) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&node_state_value(state))
}

/// Render a cluster state document from the last state reported by each node.
pub fn encode_cluster_state<'a>(
    states: impl IntoIterator<Item = &'a NodeState>,
) -> Result<String, serde_yaml::Error> {
    let mut map = Mapping::new();
    for state in states {
        map.insert(state.hostname().into(), node_state_value(state));
    }
    serde_yaml::to_string(&Value::Mapping(map))
}

/// Render the stored form of a [`Deployment`].
pub fn encode_deployment(deployment: &Deployment) -> Result<String, serde_yaml::Error> {
    let mut nodes = Mapping::new();
    for node in deployment.nodes() {
        let mut entry = Mapping::new();
        entry.insert("applications".into(), encode_applications(node.applications()));
        nodes.insert(node.hostname().into(), Value::Mapping(entry));
    }
    let mut map = Mapping::new();
    map.insert("version".into(), number(VERSION));
    map.insert("nodes".into(), Value::Mapping(nodes));
    serde_yaml::to_string(&Value::Mapping(map))
}

/// Decode the stored form of a [`Deployment`].  An empty blob is the empty
/// deployment.
pub fn decode_deployment(blob: &[u8]) -> Result<Deployment, ConfigurationError> {
    let text = std::str::from_utf8(blob).map_err(|e| ParseError::Yaml {
        kind: "Deployment",
        message: e.to_string(),
    })?;
    if text.trim().is_empty() {
        return Ok(Deployment::empty());
    }

    let doc = load("Deployment", text)?;
    let empty = Mapping::new();
    let entries = versioned(&doc, "Deployment configuration", "nodes", &empty)?;
    let hosts = as_mapping(entries, &empty).ok_or_else(|| {
        invalid(format!(
            "Deployment configuration has an error. 'nodes' must be a mapping, got {}.",
            type_name(entries)
        ))
    })?;

    let mut nodes = Vec::new();
    for (hostname, entry) in hosts {
        let hostname = scalar(hostname);
        let what = format!("Node {hostname} configuration");
        let applications = match entry.get("applications") {
            Some(applications) => decode_applications(applications, &what, STATE_KEYS)?,
            None if entry.is_null() => BTreeMap::new(),
            None => {
                return Err(invalid(format!(
                    "{what} has an error. Missing 'applications' key."
                )))
            }
        };
        nodes.push(Node::new(hostname, applications.into_values())?);
    }
    Ok(Deployment::new(nodes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use proptest::prelude::*;

    fn mysql() -> Application {
        Application::new("mysql-hybridcluster", DockerImage::new("hybridlogic/mysql5.9", "latest").unwrap())
    }

    #[test]
    fn test_parse_configuration() {
        let deployment = "version: 1\nnodes:\n  node1.example.com: [mysql-hybridcluster]\n";
        let applications = "version: 1\napplications:\n  mysql-hybridcluster:\n    image: hybridlogic/mysql5.9:latest\n";

        let parsed = parse_configuration(deployment, applications).unwrap();
        let expected = Deployment::new([Node::new("node1.example.com", [mysql()]).unwrap()]).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_missing_applications_key() {
        let err = parse_configuration("version: 1\nnodes: {}\n", "{}").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration Error: Application configuration has an error. Missing 'applications' key."
        );
    }

    #[test]
    fn test_unsupported_version() {
        let err = parse_applications("version: 2\napplications: {}\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration Error: Application configuration has an error. Unsupported version: 2."
        );
    }

    #[test]
    fn test_unrecognised_application_name() {
        let err = parse_configuration(
            "version: 1\nnodes:\n  node1: [missing]\n",
            "version: 1\napplications: {}\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration Error: Node node1 has a config error. Unrecognised application name: missing."
        );
    }

    #[test]
    fn test_unrecognised_application_keys() {
        let err = parse_applications(
            "version: 1\napplications:\n  web:\n    image: nginx\n    colour: blue\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration Error: Application 'web' has a config error. Unrecognised keys: colour."
        );
    }

    #[test]
    fn test_invalid_yaml_names_the_document() {
        let bad = "{'foo':'bar', 'x':y, '':'";
        let err = parse_configuration(bad, "").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Deployment config could not be parsed as YAML"));

        let err = parse_configuration("", bad).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Application config could not be parsed as YAML"));

        let err = parse_cluster_state(bad).unwrap_err();
        assert!(err.to_string().starts_with("Current config could not be parsed as YAML"));
    }

    #[test]
    fn test_cluster_state_volume_defaults_to_application_name() {
        let current = "node2.example.com:\n  version: 1\n  applications:\n    mysql-something:\n      image: unknown\n      volume:\n        mountpoint: /var/lib/data\n";

        let parsed = parse_cluster_state(current).unwrap();
        let expected = Deployment::new([Node::new(
            "node2.example.com",
            [Application::new("mysql-something", DockerImage::new("unknown", "latest").unwrap())
                .with_volume(AttachedVolume::new("mysql-something", "/var/lib/data").unwrap())],
        )
        .unwrap()])
        .unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_deployment_round_trip() {
        let db = Application::new("db", DockerImage::new("postgres", "16").unwrap())
            .with_ports([PortMap::new(5432, 15432)])
            .with_volume(AttachedVolume::new("db-vol", "/var/lib/postgresql").unwrap())
            .with_restart_policy(RestartPolicy::OnFailure {
                maximum_retry_count: NonZeroU32::new(3),
            });
        let web = Application::new("web", DockerImage::new("nginx", "1.25").unwrap())
            .with_links([Link {
                local_port: 5432,
                remote_port: 15432,
                alias: "db".into(),
            }])
            .with_restart_policy(RestartPolicy::Always);
        let stopped = Application::new("batch", DockerImage::new("busybox", "latest").unwrap()).with_running(false);

        let deployment = Deployment::new([
            Node::new("h1", [db, web]).unwrap(),
            Node::new("h2", [stopped]).unwrap(),
            Node::empty("h3"),
        ])
        .unwrap();

        let encoded = encode_deployment(&deployment).unwrap();
        assert_eq!(decode_deployment(encoded.as_bytes()).unwrap(), deployment);
    }

    #[test]
    fn test_empty_blob_is_empty_deployment() {
        assert_eq!(decode_deployment(b"").unwrap(), Deployment::empty());
    }

    #[test]
    fn test_node_state_document_shape() {
        let state = NodeState {
            node: Node::new(
                "h1",
                [
                    Application::new("site-example.com", DockerImage::new("clusterhq/wordpress", "latest").unwrap()),
                    Application::new("site-example.net", DockerImage::new("clusterhq/wordpress", "latest").unwrap())
                        .with_running(false),
                ],
            )
            .unwrap(),
            used_ports: [52000, 1, 200, 10].into_iter().collect(),
        };

        let text = encode_node_state(&state).unwrap();
        let value: Value = serde_yaml::from_str(&text).unwrap();
        let expected: Value = serde_yaml::from_str(
            "version: 1\n\
             applications:\n\
             \x20 site-example.com:\n\
             \x20   image: clusterhq/wordpress:latest\n\
             \x20   restart_policy: {name: never}\n\
             \x20 site-example.net:\n\
             \x20   image: clusterhq/wordpress:latest\n\
             \x20   restart_policy: {name: never}\n\
             \x20   running: false\n\
             used_ports: [1, 10, 200, 52000]\n",
        )
        .unwrap();
        assert_eq!(value, expected);

        assert_eq!(parse_node_state("h1", &text).unwrap(), state);
    }

    #[test]
    fn test_operators_cannot_stop_applications() {
        let err = parse_applications(
            "version: 1\napplications:\n  web:\n    image: nginx\n    running: false\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration Error: Application 'web' has a config error. Unrecognised keys: running."
        );
    }

    #[test]
    fn test_restart_policy_validation() {
        let err = parse_applications(
            "version: 1\napplications:\n  web:\n    image: nginx\n    restart_policy: {name: always, maximum_retry_count: 2}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("only valid with 'on-failure'"));
    }

    #[test]
    fn test_restart_policy_rejects_zero_retries() {
        let err = parse_applications(
            "version: 1\napplications:\n  web:\n    image: nginx\n    restart_policy: {name: on-failure, maximum_retry_count: 0}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be a positive integer"));
    }

    #[test]
    fn test_restart_policy_rejects_unknown_keys() {
        let err = parse_applications(
            "version: 1\napplications:\n  web:\n    image: nginx\n    restart_policy: {name: always, retries: 2}\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration Error: Application 'web' has a config error. Invalid restart policy. Unrecognised key: retries."
        );
    }

    proptest! {
        #[test]
        fn property_stored_deployment_round_trips(deployment in testing::deployment()) {
            let encoded = encode_deployment(&deployment).expect("encode");
            prop_assert_eq!(decode_deployment(encoded.as_bytes()).expect("decode"), deployment);
        }
    }
}
