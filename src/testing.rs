//! Strategies for generating domain values in property tests.
//!
//! Names are drawn from small alphabets so that independently generated
//! deployments share hostnames and application names often enough to
//! exercise restarts as well as plain starts and stops.

use std::collections::BTreeMap;
use std::num::NonZeroU32;

use proptest::collection::vec;
use proptest::option;
use proptest::prelude::*;

use crate::model::{
    Application, AttachedVolume, Deployment, DockerImage, Link, Node, PortMap, RestartPolicy,
};

pub fn hostname() -> impl Strategy<Value = String> {
    "node[0-2]"
}

pub fn image() -> impl Strategy<Value = DockerImage> {
    ("[a-z]{1,8}(/[a-z]{1,8})?", "latest|v[0-9]{1,3}")
        .prop_map(|(repository, tag)| DockerImage::new(repository, tag).expect("valid image"))
}

pub fn restart_policy() -> impl Strategy<Value = RestartPolicy> {
    prop_oneof![
        Just(RestartPolicy::Never),
        Just(RestartPolicy::Always),
        option::of(1..=10u32).prop_map(|count| RestartPolicy::OnFailure {
            maximum_retry_count: count.and_then(NonZeroU32::new),
        }),
    ]
}

fn ports() -> impl Strategy<Value = Vec<PortMap>> {
    vec(
        (any::<u16>(), any::<u16>()).prop_map(|(internal, external)| PortMap::new(internal, external)),
        0..3,
    )
}

fn links() -> impl Strategy<Value = Vec<Link>> {
    vec(
        (any::<u16>(), any::<u16>(), "svc[a-z]{1,5}").prop_map(|(local_port, remote_port, alias)| Link {
            local_port,
            remote_port,
            alias,
        }),
        0..3,
    )
}

fn volume() -> impl Strategy<Value = Option<AttachedVolume>> {
    option::of(
        ("vol-[a-z0-9]{1,6}", "/data/[a-z]{1,8}")
            .prop_map(|(name, mountpoint)| AttachedVolume::new(name, mountpoint).expect("absolute mountpoint")),
    )
}

pub fn application() -> impl Strategy<Value = Application> {
    (
        "app-[a-e]",
        image(),
        ports(),
        links(),
        volume(),
        restart_policy(),
        any::<bool>(),
    )
        .prop_map(|(name, image, ports, links, volume, restart_policy, running)| {
            let application = Application::new(name, image)
                .with_ports(ports)
                .with_links(links)
                .with_restart_policy(restart_policy)
                .with_running(running);
            match volume {
                Some(volume) => application.with_volume(volume),
                None => application,
            }
        })
}

pub fn node() -> impl Strategy<Value = Node> {
    (hostname(), vec(application(), 0..4)).prop_map(|(hostname, applications)| {
        let by_name: BTreeMap<String, Application> = applications
            .into_iter()
            .map(|application| (application.name.clone(), application))
            .collect();
        Node::new(hostname, by_name.into_values()).expect("unique application names")
    })
}

pub fn deployment() -> impl Strategy<Value = Deployment> {
    vec(node(), 0..3).prop_map(|nodes| {
        let by_hostname: BTreeMap<String, Node> = nodes
            .into_iter()
            .map(|node| (node.hostname().to_string(), node))
            .collect();
        Deployment::new(by_hostname.into_values()).expect("unique hostnames")
    })
}

/// A deployment as an operator would write it: every application running.
pub fn desired_deployment() -> impl Strategy<Value = Deployment> {
    deployment().prop_map(|deployment| {
        let nodes: Vec<Node> = deployment
            .nodes()
            .map(|node| {
                Node::new(
                    node.hostname(),
                    node.applications().cloned().map(|a| a.with_running(true)),
                )
                .expect("unique application names")
            })
            .collect();
        Deployment::new(nodes).expect("unique hostnames")
    })
}
