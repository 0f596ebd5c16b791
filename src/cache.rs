//! Read-only bridge over the plugin execution cache.
//!
//! The embedded plugin-execution machinery records every successful
//! attachment under `<cacheDir>/results/<network>-<containerID>-<ifname>`.
//! This bridge only ever reads those records; they are the source of truth
//! for "what did we attach to this container" once the originating
//! configuration has left the configuration directory.

use crate::error::chain;
use anyhow::{bail, Context, Result};
use getset::Getters;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// The record kind this bridge understands.
const CACHE_KIND: &str = "cniCacheV1";

#[derive(Clone, Debug, Deserialize, Getters)]
/// One on-disk attachment record.
pub struct CachedAttachment {
    #[get = "pub"]
    kind: String,

    #[get = "pub"]
    #[serde(rename = "containerId")]
    container_id: String,

    #[get = "pub"]
    #[serde(rename = "ifName")]
    if_name: String,

    #[get = "pub"]
    #[serde(rename = "networkName")]
    network_name: String,

    #[get = "pub"]
    /// The network configuration at ADD time, base64 encoded.
    config: String,

    #[get = "pub"]
    #[serde(default)]
    /// The chain result recorded at ADD time.
    result: Option<Value>,
}

impl CachedAttachment {
    /// Parse a record from a cache file, verifying its kind.
    fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("read cache file {}", path.display()))?;
        let attachment: Self =
            serde_json::from_slice(&bytes).context("deserialize cache record")?;
        if attachment.kind() != CACHE_KIND {
            bail!("unsupported cache record kind {}", attachment.kind());
        }
        Ok(attachment)
    }

    /// The decoded network configuration bytes at ADD time.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        base64::decode(self.config()).context("decode cached network config")
    }
}

#[derive(Clone, Debug)]
/// Reader for the `results/` directory of the plugin execution cache.
pub struct CacheBridge {
    results_dir: PathBuf,
}

impl CacheBridge {
    /// Create a bridge over the provided results directory.
    pub fn new<P: Into<PathBuf>>(results_dir: P) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    /// Look up the record of one attachment.
    pub fn get(
        &self,
        network_name: &str,
        container_id: &str,
        ifname: &str,
    ) -> Result<Option<CachedAttachment>> {
        let path = self
            .results_dir
            .join(format!("{}-{}-{}", network_name, container_id, ifname));
        if !path.is_file() {
            return Ok(None);
        }
        CachedAttachment::from_file(&path).map(Some)
    }

    /// All attachments recorded for a container, sorted by interface name so
    /// teardown visits them in the order they were assigned.
    pub fn list(&self, container_id: &str) -> Result<Vec<CachedAttachment>> {
        if !self.results_dir.is_dir() {
            return Ok(vec![]);
        }

        let mut attachments = vec![];
        for entry in fs::read_dir(&self.results_dir)
            .with_context(|| format!("read cache path {}", self.results_dir.display()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
        {
            match CachedAttachment::from_file(&entry) {
                Ok(attachment) if attachment.container_id() == container_id => {
                    debug!(
                        "Found cached attachment {} on {} for container {}",
                        attachment.network_name(),
                        attachment.if_name(),
                        container_id
                    );
                    attachments.push(attachment);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Skipping unreadable cache file {}: {}",
                        entry.display(),
                        chain(e)
                    );
                }
            }
        }

        attachments.sort_by(|a, b| a.if_name().cmp(b.if_name()));
        Ok(attachments)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use tempfile::TempDir;

    pub fn write_cache_record(
        cache_dir: &Path,
        network: &str,
        container_id: &str,
        ifname: &str,
        config: &str,
        result: Option<&str>,
    ) -> Result<()> {
        let results_dir = cache_dir.join("results");
        fs::create_dir_all(&results_dir)?;
        let result_field = match result {
            Some(r) => format!(r#", "result": {}"#, r),
            None => String::new(),
        };
        let record = format!(
            r#"{{
                "kind": "cniCacheV1",
                "containerId": "{}",
                "config": "{}",
                "ifName": "{}",
                "networkName": "{}"{}
            }}"#,
            container_id,
            base64::encode(config),
            ifname,
            network,
            result_field,
        );
        fs::write(
            results_dir.join(format!("{}-{}-{}", network, container_id, ifname)),
            record,
        )?;
        Ok(())
    }

    const CONFIG: &str = r#"{ "cniVersion": "0.3.1", "name": "net", "type": "myplugin" }"#;

    #[test]
    fn get_found() -> Result<()> {
        let temp_dir = TempDir::new()?;
        write_cache_record(temp_dir.path(), "net", "id-1", "eth0", CONFIG, None)?;

        let bridge = CacheBridge::new(temp_dir.path().join("results"));
        let attachment = bridge.get("net", "id-1", "eth0")?.context("no record")?;

        assert_eq!(attachment.network_name(), "net");
        assert_eq!(attachment.if_name(), "eth0");
        assert_eq!(attachment.config_bytes()?, CONFIG.as_bytes());
        Ok(())
    }

    #[test]
    fn get_missing_is_none() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let bridge = CacheBridge::new(temp_dir.path().join("results"));
        assert!(bridge.get("net", "id-1", "eth0")?.is_none());
        Ok(())
    }

    #[test]
    fn list_filters_by_container_and_sorts_by_ifname() -> Result<()> {
        let temp_dir = TempDir::new()?;
        write_cache_record(temp_dir.path(), "network2", "id-1", "eth1", CONFIG, None)?;
        write_cache_record(temp_dir.path(), "network1", "id-1", "eth0", CONFIG, None)?;
        write_cache_record(temp_dir.path(), "network1", "id-2", "eth0", CONFIG, None)?;

        let bridge = CacheBridge::new(temp_dir.path().join("results"));
        let attachments = bridge.list("id-1")?;

        assert_eq!(attachments.len(), 2);
        assert_eq!(attachments[0].if_name(), "eth0");
        assert_eq!(attachments[0].network_name(), "network1");
        assert_eq!(attachments[1].if_name(), "eth1");
        assert_eq!(attachments[1].network_name(), "network2");
        Ok(())
    }

    #[test]
    fn list_skips_unparseable_records() -> Result<()> {
        let temp_dir = TempDir::new()?;
        write_cache_record(temp_dir.path(), "net", "id-1", "eth0", CONFIG, None)?;
        let results_dir = temp_dir.path().join("results");
        fs::write(results_dir.join("garbage"), "not json")?;

        let bridge = CacheBridge::new(temp_dir.path().join("results"));
        assert_eq!(bridge.list("id-1")?.len(), 1);
        Ok(())
    }

    #[test]
    fn list_empty_cache_dir() -> Result<()> {
        let bridge = CacheBridge::new(Path::new("/does/not/exist"));
        assert!(bridge.list("id-1")?.is_empty());
        Ok(())
    }

    #[test]
    fn wrong_kind_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let results_dir = temp_dir.path().join("results");
        fs::create_dir_all(&results_dir)?;
        fs::write(
            results_dir.join("net-id-1-eth0"),
            r#"{ "kind": "cniCacheV2", "containerId": "id-1", "config": "", "ifName": "eth0", "networkName": "net" }"#,
        )?;

        let bridge = CacheBridge::new(temp_dir.path().join("results"));
        assert!(bridge.get("net", "id-1", "eth0").is_err());
        Ok(())
    }

    #[test]
    fn record_with_result() -> Result<()> {
        let temp_dir = TempDir::new()?;
        write_cache_record(
            temp_dir.path(),
            "net",
            "id-1",
            "eth0",
            CONFIG,
            Some(r#"{ "cniVersion": "0.3.1", "ips": [{"address": "10.1.1.2/24"}] }"#),
        )?;

        let bridge = CacheBridge::new(temp_dir.path().join("results"));
        let attachment = bridge.get("net", "id-1", "eth0")?.context("no record")?;
        let result = attachment.result().as_ref().context("no result")?;
        assert_eq!(result["ips"][0]["address"], "10.1.1.2/24");
        Ok(())
    }
}
