//! Configuration related structures

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use std::{path::PathBuf, time::Duration};

/// The default path searched for network configuration files.
pub const DEFAULT_CONF_DIR: &str = "/etc/cni/net.d";

/// The default path searched for plugin binaries.
pub const DEFAULT_BIN_DIR: &str = "/opt/cni/bin";

/// The default path of the plugin result cache.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/cni/cache";

#[derive(Builder, Clone, CopyGetters, Debug, Getters)]
#[builder(pattern = "owned", setter(into))]
/// Config is the configuration for a `CNI` network manager instance.
pub struct Config {
    #[get = "pub"]
    #[builder(default = "DEFAULT_CONF_DIR.into()")]
    /// The directory containing network configuration files.
    conf_dir: PathBuf,

    #[get = "pub"]
    #[builder(default = "DEFAULT_BIN_DIR.into()")]
    /// The directory searched for plugin binaries.
    bin_dir: PathBuf,

    #[get = "pub"]
    #[builder(default = "DEFAULT_CACHE_DIR.into()")]
    /// The directory of the plugin execution cache.
    cache_dir: PathBuf,

    #[get = "pub"]
    #[builder(default)]
    /// The name of the default network. Chosen by configuration file order
    /// if unset.
    default_network_name: Option<String>,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_secs(5)")]
    /// Interval of the unconditional configuration resync.
    resync_interval: Duration,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_millis(200)")]
    /// Window within which rapid file events are coalesced.
    debounce: Duration,

    #[get_copy = "pub"]
    #[builder(default = "Duration::from_secs(220)")]
    /// Wall-clock ceiling for a single plugin invocation.
    exec_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conf_dir: DEFAULT_CONF_DIR.into(),
            bin_dir: DEFAULT_BIN_DIR.into(),
            cache_dir: DEFAULT_CACHE_DIR.into(),
            default_network_name: None,
            resync_interval: Duration::from_secs(5),
            debounce: Duration::from_millis(200),
            exec_timeout: Duration::from_secs(220),
        }
    }
}

impl Config {
    /// The `results` subdirectory holding per-attachment cache records.
    pub fn cache_results_dir(&self) -> PathBuf {
        self.cache_dir().join("results")
    }
}
