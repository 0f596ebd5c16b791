//! CNI network configuration loading from disk.

use crate::error::chain;
use anyhow::{bail, Context, Result};
use getset::Getters;
use log::{debug, info, warn};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The lowest CNI specification version carrying the GC and STATUS verbs.
const VERB_GC_STATUS_MIN_VERSION: &str = "1.1.0";

#[derive(Clone, Debug, Getters)]
/// A named, version-tagged plugin chain loaded from a single file. Immutable
/// once constructed; replaced wholesale when its source file changes.
pub struct Network {
    #[get = "pub"]
    /// The declared network name, unique within a registry snapshot.
    name: String,

    #[get = "pub"]
    /// The source file, used for deterministic tiebreaking only.
    file: PathBuf,

    #[get = "pub"]
    /// The parsed plugin chain.
    list: ConfigListFile,

    #[get = "pub"]
    /// The canonical bytes of the configuration file.
    bytes: Vec<u8>,
}

impl Network {
    /// Load a network from the provided configuration file path.
    pub fn from_file(file: &Path) -> Result<Self> {
        debug!("Loading network from file {}", file.display());
        let bytes = fs::read(file).with_context(|| format!("read file {}", file.display()))?;

        let list = match file.extension().and_then(OsStr::to_str) {
            Some("conflist") => ConfigListFile::from_bytes(&bytes)
                .with_context(|| format!("deserialize config list from {}", file.display()))?,
            _ => ConfigFile::from_bytes(&bytes)
                .with_context(|| format!("deserialize config from {}", file.display()))?
                .into(),
        };

        let name = list
            .name()
            .as_ref()
            .context("no network name provided")?
            .clone();
        if list.plugins().is_empty() {
            bail!("network {} has no plugins", name);
        }

        Ok(Self {
            name,
            file: file.into(),
            list,
            bytes,
        })
    }

    /// The `cniVersion` declared by the chain, also forwarded to plugins.
    pub fn cni_version(&self) -> &str {
        self.list
            .cni_version()
            .as_deref()
            .unwrap_or_default()
    }

    /// Rebuild a network from the configuration bytes a cache record
    /// carries, so detach works after the source file left the directory.
    pub fn from_cached_config(name: &str, bytes: &[u8]) -> Result<Self> {
        let list = match ConfigListFile::from_bytes(bytes) {
            Ok(list) if !list.plugins().is_empty() => list,
            _ => ConfigFile::from_bytes(bytes)
                .context("deserialize cached network config")?
                .into(),
        };
        Ok(Self {
            name: name.into(),
            file: PathBuf::new(),
            list,
            bytes: bytes.to_vec(),
        })
    }

    /// Whether the chain's declared version carries the GC and STATUS verbs.
    pub fn supports_gc_and_status(&self) -> bool {
        match (
            Version::parse(self.cni_version()),
            Version::parse(VERB_GC_STATUS_MIN_VERSION),
        ) {
            (Ok(version), Ok(min)) => version >= min,
            _ => false,
        }
    }
}

/// The result of loading a configuration directory: all parseable networks
/// keyed by name plus the candidate default (first inserted).
pub struct LoadedNetworks {
    pub networks: HashMap<String, Arc<Network>>,
    pub first_name: Option<String>,
}

/// Load all networks from a configuration directory.
///
/// Files are visited in byte-lexicographic filename order. The first file
/// declaring a name wins; later same-named files are ignored. Unparseable
/// files are skipped with a warning. A missing or empty directory yields an
/// empty result without error.
pub fn load_networks(conf_dir: &Path) -> Result<LoadedNetworks> {
    let mut networks = HashMap::new();
    let mut first_name = None;

    for file in config_files(conf_dir).context("enumerate config files")? {
        let network = match Network::from_file(&file) {
            Err(e) => {
                warn!("Unable to load network {}: {}", file.display(), chain(e));
                continue;
            }
            Ok(network) => network,
        };

        if networks.contains_key(network.name()) {
            debug!(
                "Ignoring {}: network {} already defined by an earlier file",
                file.display(),
                network.name()
            );
            continue;
        }

        info!(
            "Found valid network config {} (type {}) in {}",
            network.name(),
            network
                .list()
                .plugins()
                .get(0)
                .context("no plugin in config list")?
                .typ(),
            file.display()
        );

        if first_name.is_none() {
            first_name = Some(network.name().clone());
        }
        networks.insert(network.name().clone(), Arc::new(network));
    }

    Ok(LoadedNetworks {
        networks,
        first_name,
    })
}

/// Returns all config files in `conf_dir`, sorted by filename.
fn config_files(conf_dir: &Path) -> Result<Vec<PathBuf>> {
    if !conf_dir.is_dir() {
        return Ok(vec![]);
    }
    let mut files = fs::read_dir(conf_dir)
        .with_context(|| format!("read config path {}", conf_dir.display()))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|e| is_config_file(e))
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Returns true if the file path is a possible config file.
fn is_config_file(file: &Path) -> bool {
    file.is_file() && has_config_file_extension(file)
}

/// Returns true if the file path has a config file extension.
fn has_config_file_extension(file: &Path) -> bool {
    file.extension() == Some(OsStr::new("conf"))
        || file.extension() == Some(OsStr::new("conflist"))
        || file.extension() == Some(OsStr::new("json"))
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters)]
/// A single plugin configuration. Keys not modeled here are retained in
/// `specific` so the exact plugin configuration round-trips onto stdin.
pub struct ConfigFile {
    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "cniVersion"
    )]
    cni_version: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[getset(get = "pub")]
    #[serde(rename = "type")]
    typ: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capabilities: Option<HashMap<String, bool>>,

    #[getset(get = "pub")]
    #[serde(flatten)]
    specific: Map<String, Value>,
}

impl ConfigFile {
    /// Deserialize a single plugin config, defaulting a missing name to the
    /// plugin type.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut config: Self =
            serde_json::from_slice(bytes).context("deserialize CNI config")?;
        if config.name().is_none() {
            config.name = Some(config.typ().clone());
        }
        Ok(config)
    }
}

impl From<ConfigFile> for ConfigListFile {
    fn from(config: ConfigFile) -> Self {
        ConfigListFile {
            cni_version: config.cni_version.clone(),
            name: config.name.clone(),
            plugins: vec![config],
            ..Default::default()
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Getters)]
/// An ordered list of plugin configurations executed for one attachment.
pub struct ConfigListFile {
    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "cniVersion"
    )]
    cni_version: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "disableCheck"
    )]
    disable_check: Option<bool>,

    #[getset(get = "pub")]
    plugins: Vec<ConfigFile>,
}

impl ConfigListFile {
    /// Deserialize a plugin chain configuration.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("deserialize CNI config list")
    }
}
