//! Pod-facing data structures and runtime configuration assembly.

use crate::{
    error::NetworkError,
    plugin::{CNIResult, InvokeArgs, DNS},
};
use anyhow::Result;
use derive_builder::Builder;
use getset::Getters;
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, net::IpAddr, path::PathBuf};

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// The runtime's description of a pod whose network namespace gets wired up.
pub struct PodNetwork {
    #[get = "pub"]
    /// Namespace the pod lives in.
    namespace: String,

    #[get = "pub"]
    /// Name of the pod.
    name: String,

    #[get = "pub"]
    /// The infra container ID, the ownership key for cache and lock table.
    id: String,

    #[get = "pub"]
    /// The pod UID.
    uid: String,

    #[get = "pub"]
    /// Path to the pod's network namespace.
    netns_path: PathBuf,

    #[get = "pub"]
    /// Explicit attachments. When empty, the default network applies.
    networks: Vec<NetAttachment>,

    #[get = "pub"]
    /// Per-network runtime options, keyed by network name.
    runtime_config: HashMap<String, RuntimeConfig>,

    #[get = "pub"]
    /// Per-network hostname aliases, keyed by network name.
    aliases: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, Getters, PartialEq)]
/// One (network, interface) pairing requested for a pod.
pub struct NetAttachment {
    #[get = "pub"]
    /// The network name to attach.
    name: String,

    #[get = "pub"]
    /// The interface name inside the pod namespace. Assigned positionally
    /// (`eth0`, `eth1`, …) when unset.
    ifname: Option<String>,
}

impl NetAttachment {
    /// An attachment using positional interface naming.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ifname: None,
        }
    }

    /// An attachment with an explicit interface name.
    pub fn with_ifname<S: Into<String>, I: Into<String>>(name: S, ifname: I) -> Self {
        Self {
            name: name.into(),
            ifname: Some(ifname.into()),
        }
    }
}

#[derive(Clone, Debug, Getters, PartialEq)]
/// The outcome of attaching one network to a pod.
pub struct NetResult {
    #[get = "pub"]
    /// The attachment with its final interface name.
    attachment: NetAttachment,

    #[get = "pub"]
    /// The plugin chain's result.
    result: CNIResult,
}

impl NetResult {
    pub fn new(attachment: NetAttachment, result: CNIResult) -> Self {
        Self { attachment, result }
    }
}

#[derive(Builder, Clone, Debug, Default, Getters)]
#[builder(default, pattern = "owned", setter(into))]
/// Optional per-network runtime options provided by the caller.
pub struct RuntimeConfig {
    #[get = "pub"]
    /// A requested static IP address.
    ip: Option<String>,

    #[get = "pub"]
    /// A requested MAC address.
    mac: Option<String>,

    #[get = "pub"]
    /// Host to container port mappings.
    port_mappings: Vec<PortMapping>,

    #[get = "pub"]
    /// Ingress/egress traffic shaping.
    bandwidth: Option<Bandwidth>,

    #[get = "pub"]
    /// Requested IP ranges.
    ip_ranges: Vec<Vec<IpRange>>,

    #[get = "pub"]
    /// The cgroup path of the pod.
    cgroup_path: Option<String>,

    #[get = "pub"]
    /// DNS settings for the attachment.
    dns: Option<DNS>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, Serialize, PartialEq)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "camelCase")]
/// A PortMapping represents a host to container port connection.
pub struct PortMapping {
    #[get = "pub"]
    /// The port on the host.
    host_port: u16,

    #[get = "pub"]
    /// The port inside the container.
    container_port: u16,

    #[get = "pub"]
    /// The protocol of the port mapping.
    protocol: String,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "hostIP")]
    /// The host IP to bind, all interfaces when unset.
    host_ip: Option<String>,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, Serialize, PartialEq)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "camelCase")]
/// Traffic shaping values, all in bits per second respectively bits.
pub struct Bandwidth {
    #[get = "pub"]
    ingress_rate: u64,

    #[get = "pub"]
    ingress_burst: u64,

    #[get = "pub"]
    egress_rate: u64,

    #[get = "pub"]
    egress_burst: u64,
}

#[derive(Builder, Clone, Debug, Default, Deserialize, Getters, Serialize, PartialEq)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
/// A single requested IP range.
pub struct IpRange {
    #[get = "pub"]
    subnet: String,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range_start: Option<String>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,

    #[get = "pub"]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gateway: Option<String>,
}

#[derive(Debug, Default, Getters)]
/// Everything a plugin chain invocation needs for one attachment: the
/// process environment identity and the capability arguments merged into
/// each plugin's `runtimeConfig`.
pub struct RuntimeConf {
    #[get = "pub"]
    /// Per-invocation environment identity.
    invoke: InvokeArgs,

    #[get = "pub"]
    /// Capability name to structured value.
    capability_args: Map<String, Value>,
}

impl RuntimeConf {
    /// Assemble the runtime conf for one attachment of `pod`.
    ///
    /// Validation failures surface before any plugin is invoked. Empty
    /// collection fields are dropped entirely.
    pub fn build(pod: &PodNetwork, network_name: &str, ifname: &str) -> Result<Self> {
        let mut plugin_args = vec![
            ("IgnoreUnknown".to_string(), "1".to_string()),
            ("K8S_POD_NAMESPACE".to_string(), pod.namespace().clone()),
            ("K8S_POD_NAME".to_string(), pod.name().clone()),
            (
                "K8S_POD_INFRA_CONTAINER_ID".to_string(),
                pod.id().clone(),
            ),
            ("K8S_POD_UID".to_string(), pod.uid().clone()),
        ];

        let runtime_config = pod.runtime_config().get(network_name);
        let mut capability_args = Map::new();

        if let Some(config) = runtime_config {
            if let Some(ip) = config.ip() {
                ip.parse::<IpAddr>().map_err(|_| {
                    NetworkError::InvalidRuntimeConfig(format!(
                        "unable to parse IP address {:?}",
                        ip
                    ))
                })?;
                plugin_args.push(("IP".to_string(), ip.clone()));
            }

            if let Some(mac) = config.mac() {
                mac.parse::<MacAddr6>().map_err(|_| {
                    NetworkError::InvalidRuntimeConfig(format!(
                        "unable to parse MAC address {:?}",
                        mac
                    ))
                })?;
                plugin_args.push(("MAC".to_string(), mac.clone()));
            }

            if !config.port_mappings().is_empty() {
                capability_args.insert(
                    "portMappings".into(),
                    serde_json::to_value(config.port_mappings())?,
                );
            }

            if let Some(bandwidth) = config.bandwidth() {
                capability_args.insert("bandwidth".into(), serde_json::to_value(bandwidth)?);
            }

            if !config.ip_ranges().is_empty() {
                capability_args
                    .insert("ipRanges".into(), serde_json::to_value(config.ip_ranges())?);
            }

            if let Some(cgroup_path) = config.cgroup_path() {
                capability_args.insert("cgroupPath".into(), Value::from(cgroup_path.clone()));
            }

            if let Some(dns) = config.dns() {
                capability_args.insert("dns".into(), serde_json::to_value(dns)?);
            }
        }

        if let Some(aliases) = pod.aliases().get(network_name) {
            if !aliases.is_empty() {
                capability_args.insert("aliases".into(), serde_json::to_value(aliases)?);
            }
        }

        Ok(Self {
            invoke: InvokeArgs {
                container_id: pod.id().clone(),
                netns: pod.netns_path().display().to_string(),
                ifname: ifname.into(),
                plugin_args,
            },
            capability_args,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Context;

    pub fn new_pod(networks: Vec<NetAttachment>) -> Result<PodNetwork> {
        Ok(PodNetworkBuilder::default()
            .namespace("default")
            .name("pod")
            .id("1234567890")
            .uid("uid-1")
            .netns_path("/proc/1/ns/net")
            .networks(networks)
            .build()?)
    }

    fn arg<'a>(conf: &'a RuntimeConf, key: &str) -> Option<&'a str> {
        conf.invoke()
            .plugin_args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn build_pod_identity_args() -> Result<()> {
        let pod = new_pod(vec![])?;
        let conf = RuntimeConf::build(&pod, "net", "eth0")?;

        assert_eq!(
            conf.invoke().plugin_args,
            vec![
                ("IgnoreUnknown".to_string(), "1".to_string()),
                ("K8S_POD_NAMESPACE".to_string(), "default".to_string()),
                ("K8S_POD_NAME".to_string(), "pod".to_string()),
                ("K8S_POD_INFRA_CONTAINER_ID".to_string(), "1234567890".to_string()),
                ("K8S_POD_UID".to_string(), "uid-1".to_string()),
            ]
        );
        assert!(conf.capability_args().is_empty());
        assert_eq!(conf.invoke().ifname, "eth0");
        Ok(())
    }

    #[test]
    fn build_ip_and_mac_args() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config.insert(
            "net".into(),
            RuntimeConfigBuilder::default()
                .ip(Some("172.16.0.1".into()))
                .mac(Some("9e:0c:d9:b2:f0:a6".into()))
                .build()?,
        );

        let conf = RuntimeConf::build(&pod, "net", "eth0")?;
        assert_eq!(arg(&conf, "IP"), Some("172.16.0.1"));
        assert_eq!(arg(&conf, "MAC"), Some("9e:0c:d9:b2:f0:a6"));
        Ok(())
    }

    #[test]
    fn build_rejects_invalid_ip() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config.insert(
            "net".into(),
            RuntimeConfigBuilder::default()
                .ip(Some("172.16".into()))
                .build()?,
        );

        let err = RuntimeConf::build(&pod, "net", "eth0").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetworkError>(),
            Some(NetworkError::InvalidRuntimeConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn build_rejects_invalid_mac() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config.insert(
            "net".into(),
            RuntimeConfigBuilder::default()
                .mac(Some("not-a-mac".into()))
                .build()?,
        );

        assert!(RuntimeConf::build(&pod, "net", "eth0").is_err());
        Ok(())
    }

    #[test]
    fn build_v6_ip_accepted() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config.insert(
            "net".into(),
            RuntimeConfigBuilder::default()
                .ip(Some("1100:200::1".into()))
                .build()?,
        );

        let conf = RuntimeConf::build(&pod, "net", "eth0")?;
        assert_eq!(arg(&conf, "IP"), Some("1100:200::1"));
        Ok(())
    }

    #[test]
    fn build_capability_args() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config.insert(
            "net".into(),
            RuntimeConfigBuilder::default()
                .port_mappings(vec![PortMappingBuilder::default()
                    .host_port(8080u16)
                    .container_port(80u16)
                    .protocol("tcp")
                    .build()?])
                .bandwidth(Some(
                    BandwidthBuilder::default()
                        .ingress_rate(1000u64)
                        .ingress_burst(200u64)
                        .egress_rate(2000u64)
                        .egress_burst(400u64)
                        .build()?,
                ))
                .ip_ranges(vec![vec![IpRangeBuilder::default()
                    .subnet("10.0.0.0/24")
                    .gateway("10.0.0.1")
                    .build()?]])
                .cgroup_path(Some("/kubepods/pod1".into()))
                .build()?,
        );
        pod.aliases
            .insert("net".into(), vec!["svc".into(), "svc.local".into()]);

        let conf = RuntimeConf::build(&pod, "net", "eth0")?;
        let caps = conf.capability_args();

        let mappings = caps.get("portMappings").context("no portMappings")?;
        assert_eq!(mappings[0]["hostPort"], 8080);
        assert_eq!(mappings[0]["containerPort"], 80);

        let bandwidth = caps.get("bandwidth").context("no bandwidth")?;
        assert_eq!(bandwidth["ingressRate"], 1000);
        assert_eq!(bandwidth["egressBurst"], 400);

        let ranges = caps.get("ipRanges").context("no ipRanges")?;
        assert_eq!(ranges[0][0]["subnet"], "10.0.0.0/24");
        assert_eq!(ranges[0][0]["gateway"], "10.0.0.1");
        assert!(ranges[0][0].get("rangeStart").is_none());

        assert_eq!(
            caps.get("cgroupPath"),
            Some(&Value::from("/kubepods/pod1"))
        );
        assert_eq!(
            caps.get("aliases").context("no aliases")?[1],
            "svc.local"
        );
        Ok(())
    }

    #[test]
    fn build_drops_empty_collections() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config
            .insert("net".into(), RuntimeConfig::default());
        pod.aliases.insert("net".into(), vec![]);

        let conf = RuntimeConf::build(&pod, "net", "eth0")?;
        assert!(conf.capability_args().is_empty());
        Ok(())
    }

    #[test]
    fn runtime_config_for_other_network_ignored() -> Result<()> {
        let mut pod = new_pod(vec![])?;
        pod.runtime_config.insert(
            "other".into(),
            RuntimeConfigBuilder::default()
                .ip(Some("172.16.0.1".into()))
                .build()?,
        );

        let conf = RuntimeConf::build(&pod, "net", "eth0")?;
        assert!(arg(&conf, "IP").is_none());
        Ok(())
    }
}
