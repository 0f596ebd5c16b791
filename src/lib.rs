//! This is the main library interface for the pod network orchestrator.
//!
//! The entry point is [`CNI`]: it keeps a registry of plugin chain
//! configurations in sync with a configuration directory and drives the
//! attach, detach, check, status and GC lifecycle of pod network
//! attachments through out-of-process CNI plugins.

mod cache;
mod cni;
mod config;
mod error;
mod exec;
mod loader;
mod lock_map;
mod netns;
mod plugin;
mod pod;
mod registry;
mod watch;

pub use crate::{
    cni::CNI,
    config::{Config, ConfigBuilder},
    error::{chain, NetworkError},
    exec::{Args, ArgsBuilder, DefaultExec, Exec},
    loader::{ConfigFile, ConfigListFile, Network},
    netns::{DefaultLoopback, Loopback},
    plugin::{
        CNIResult, ErrorResult, InvokeArgs, NetworkInterface, Route, VersionResult, DNS, IP,
    },
    pod::{
        Bandwidth, BandwidthBuilder, IpRange, IpRangeBuilder, NetAttachment, NetResult,
        PodNetwork, PodNetworkBuilder, PortMapping, PortMappingBuilder, RuntimeConf,
        RuntimeConfig, RuntimeConfigBuilder,
    },
    registry::Snapshot,
};
