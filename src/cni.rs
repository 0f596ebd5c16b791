//! The pod network manager: registry wiring, attachment lifecycle and
//! readiness reporting.

use crate::{
    cache::CacheBridge,
    config::Config,
    error::{chain, NetworkError},
    exec::{DefaultExec, Exec},
    loader::{self, ConfigFile, Network},
    lock_map::LockMap,
    netns::{DefaultLoopback, Loopback},
    plugin::{CNIResult, Plugin},
    pod::{NetAttachment, NetResult, PodNetwork, RuntimeConf},
    registry::{Registry, Snapshot},
    watch::Monitor,
};
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

/// The key under which a GC invocation names the attachments a plugin must
/// keep.
const GC_VALID_ATTACHMENTS_KEY: &str = "cni.dev/valid-attachments";

/// The pod network manager. One instance watches a configuration directory,
/// keeps a registry of plugin chains and drives attach/detach/check/status
/// and GC over them, serializing operations per pod.
pub struct CNI {
    config: Config,
    registry: Arc<Registry>,
    lock_map: LockMap<String>,
    cache: CacheBridge,
    exec: Arc<dyn Exec>,
    loopback: Arc<dyn Loopback>,
    monitor: Option<Monitor>,
}

/// One attachment after name resolution against a registry snapshot.
struct ResolvedAttachment {
    network: Arc<Network>,
    ifname: String,
}

impl ResolvedAttachment {
    fn as_net_attachment(&self) -> NetAttachment {
        NetAttachment::with_ifname(self.network.name().clone(), self.ifname.clone())
    }
}

impl CNI {
    /// Create a manager for the provided configuration. No disk or process
    /// activity happens before `initialize`.
    pub fn new(config: Config) -> Self {
        let cache = CacheBridge::new(config.cache_results_dir());
        let exec: Arc<dyn Exec> = Arc::new(DefaultExec::new(config.exec_timeout()));
        Self {
            config,
            registry: Arc::new(Registry::default()),
            lock_map: LockMap::default(),
            cache,
            exec,
            loopback: Arc::new(DefaultLoopback),
            monitor: None,
        }
    }

    /// Replace the plugin executor.
    pub fn set_exec(&mut self, exec: Arc<dyn Exec>) {
        self.exec = exec;
    }

    /// Replace the loopback management implementation.
    pub fn set_loopback(&mut self, loopback: Arc<dyn Loopback>) {
        self.loopback = loopback;
    }

    /// Load the initial configuration and start watching the configuration
    /// and plugin binary directories.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing pod network manager");
        match self.config.default_network_name() {
            None => info!("No default network name, choosing first one"),
            Some(name) => info!("Using default network name: {}", name),
        }

        for dir in [self.config.conf_dir(), self.config.bin_dir()] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create not existing path {}", dir.display()))?;
        }

        Self::resync(&self.config, &self.registry);

        let config = self.config.clone();
        let registry = self.registry.clone();
        let monitor = Monitor::spawn(
            &[self.config.conf_dir(), self.config.bin_dir()],
            self.config.debounce(),
            self.config.resync_interval(),
            move || Self::resync(&config, &registry),
        )
        .context("spawn directory monitor")?;
        self.monitor = Some(monitor);

        Ok(())
    }

    /// Stop the directory monitor and wait for it to exit. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    /// Reload all configurations and publish a fresh registry snapshot.
    fn resync(config: &Config, registry: &Registry) {
        match loader::load_networks(config.conf_dir()) {
            Ok(loaded) => {
                registry.replace(loaded.into());
                Self::log_networks(&registry.snapshot());
            }
            Err(e) => error!("Unable to reload network configurations: {}", chain(e)),
        }
    }

    /// Log the currently loaded networks by their name.
    fn log_networks(snapshot: &Snapshot) {
        let len = snapshot.networks().len();
        if len == 0 {
            info!("No loaded networks");
        } else {
            let mut names = snapshot.networks().keys().cloned().collect::<Vec<_>>();
            names.sort();
            info!(
                "Currently loaded {} network{}: {}",
                len,
                if len > 1 { "s" } else { "" },
                names.join(", ")
            );
        }
    }

    /// The current registry snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.registry.snapshot()
    }

    /// The default network of the current snapshot.
    pub fn default_network(&self) -> Result<Arc<Network>> {
        self.registry
            .snapshot()
            .resolve_default(self.config.default_network_name().as_deref())
    }

    /// Whether everything required to attach pods is in place: a non-empty
    /// registry, a resolvable default network and its plugin binaries. The
    /// reason for not being ready is returned.
    fn ready_error(&self, snapshot: &Snapshot) -> Option<String> {
        if snapshot.networks().is_empty() {
            return Some("no network configurations loaded".into());
        }

        let default =
            match snapshot.resolve_default(self.config.default_network_name().as_deref()) {
                Ok(network) => network,
                Err(e) => return Some(chain(e)),
            };

        for plugin_conf in default.list().plugins() {
            if crate::plugin::find_binary(plugin_conf.typ(), self.config.bin_dir()).is_err() {
                return Some(format!(
                    "plugin binary {} for default network {} not found in {}",
                    plugin_conf.typ(),
                    default.name(),
                    self.config.bin_dir().display()
                ));
            }
        }

        None
    }

    /// Report readiness. Returns an error naming the missing component when
    /// the manager cannot attach pods, and surfaces a STATUS probe of the
    /// default chain when its version carries the verb.
    pub async fn status(&self) -> Result<()> {
        let snapshot = self.registry.snapshot();
        if let Some(reason) = self.ready_error(&snapshot) {
            return Err(NetworkError::NotReady(reason).into());
        }

        let default = snapshot
            .resolve_default(self.config.default_network_name().as_deref())
            .context("resolve default network")?;

        if default.supports_gc_and_status() {
            self.probe_status(&default)
                .await
                .with_context(|| format!("STATUS probe of default network {}", default.name()))?;
        }

        Ok(())
    }

    /// Invoke the STATUS verb on every plugin of the chain.
    async fn probe_status(&self, network: &Network) -> Result<()> {
        for plugin_conf in network.list().plugins() {
            let plugin =
                Plugin::resolve(plugin_conf.typ(), self.config.bin_dir(), self.exec.clone())?;
            let stdin = plugin_stdin(network, plugin_conf, &Map::new(), None, &[])?;
            plugin
                .status(&stdin)
                .await
                .with_context(|| format!("STATUS of plugin {}", plugin_conf.typ()))?;
        }
        Ok(())
    }

    /// Resolve the target attachment list of a pod: its explicit list, or
    /// the default network on `eth0`. Missing interface names are assigned
    /// positionally.
    fn resolve_attachments(
        &self,
        pod: &PodNetwork,
        snapshot: &Snapshot,
    ) -> Result<Vec<ResolvedAttachment>> {
        let requested = if pod.networks().is_empty() {
            let default = snapshot
                .resolve_default(self.config.default_network_name().as_deref())
                .context("resolve default network")?;
            vec![NetAttachment::new(default.name().clone())]
        } else {
            pod.networks().clone()
        };

        let mut seen = HashSet::new();
        let mut resolved = vec![];
        for (i, attachment) in requested.iter().enumerate() {
            let network = snapshot.lookup(attachment.name())?;
            let ifname = attachment
                .ifname()
                .clone()
                .unwrap_or_else(|| format!("eth{}", i));
            if !seen.insert(ifname.clone()) {
                return Err(NetworkError::InvalidRuntimeConfig(format!(
                    "interface name {} requested more than once",
                    ifname
                ))
                .into());
            }
            resolved.push(ResolvedAttachment { network, ifname });
        }
        Ok(resolved)
    }

    /// Attach all of the pod's networks. Returns one result per attachment,
    /// in order. A failed attachment detaches every prior one in reverse
    /// order before the error is returned.
    pub async fn setup_pod(&self, pod: &PodNetwork) -> Result<Vec<NetResult>> {
        let _guard = self.lock_map.lock(pod.id().clone()).await;
        let snapshot = self.registry.snapshot();

        let attachments = self.resolve_attachments(pod, &snapshot)?;

        // Validate every runtime conf before the first plugin runs.
        let mut prepared = vec![];
        for attachment in attachments {
            let conf = RuntimeConf::build(pod, attachment.network.name(), &attachment.ifname)?;
            prepared.push((attachment, conf));
        }

        self.loopback
            .up(pod.netns_path())
            .await
            .context("bring up loopback interface")?;

        let mut results: Vec<NetResult> = vec![];
        for (idx, (attachment, conf)) in prepared.iter().enumerate() {
            match self.attach_chain(&attachment.network, conf).await {
                Ok(result) => {
                    info!(
                        "Attached network {} to pod {} on {}",
                        attachment.network.name(),
                        pod.name(),
                        attachment.ifname
                    );
                    results.push(NetResult::new(attachment.as_net_attachment(), result));
                }
                Err(e) => {
                    let network = attachment.network.name().clone();
                    let message = e.to_string();
                    warn!(
                        "Unable to attach network {} to pod {}, detaching {} prior attachment{}",
                        network,
                        pod.name(),
                        idx,
                        if idx == 1 { "" } else { "s" }
                    );

                    for (prev, prev_conf) in prepared[..idx].iter().rev() {
                        if let Err(del_err) = self.detach_chain(&prev.network, prev_conf, None).await
                        {
                            error!(
                                "Unable to detach network {} while unwinding: {}",
                                prev.network.name(),
                                chain(del_err)
                            );
                        }
                    }

                    return Err(e).context(NetworkError::PartialSetup { network, message });
                }
            }
        }

        Ok(results)
    }

    /// Detach all of the pod's networks. The attachment set comes from the
    /// pod's explicit list or, when empty, from the cache records of its
    /// container. Every attachment is attempted; the first non-benign error
    /// is returned.
    pub async fn teardown_pod(&self, pod: &PodNetwork) -> Result<()> {
        let _guard = self.lock_map.lock(pod.id().clone()).await;
        let snapshot = self.registry.snapshot();

        let targets = self.teardown_targets(pod, &snapshot)?;
        if targets.is_empty() {
            debug!("Nothing to tear down for pod {}", pod.name());
            return Ok(());
        }

        let mut first_error: Option<anyhow::Error> = None;
        for (network, ifname, prev_result) in targets {
            let outcome = match RuntimeConf::build(pod, network.name(), &ifname) {
                Ok(conf) => {
                    self.detach_chain(&network, &conf, prev_result.as_ref())
                        .await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                let benign = matches!(
                    e.downcast_ref::<NetworkError>(),
                    Some(kind) if kind.is_benign_on_teardown()
                );
                if benign {
                    debug!("Attachment {} on {} already gone", network.name(), ifname);
                } else {
                    error!(
                        "Unable to detach network {} of pod {}: {:#}",
                        network.name(),
                        pod.name(),
                        e
                    );
                    first_error.get_or_insert(e);
                }
            } else {
                info!(
                    "Detached network {} from pod {} on {}",
                    network.name(),
                    pod.name(),
                    ifname
                );
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Determine what to detach: `(network, ifname, cached result)` per
    /// attachment. Configurations fall back to the cache records when the
    /// registry no longer carries the network; attachments known to neither
    /// are already gone and get skipped.
    fn teardown_targets(
        &self,
        pod: &PodNetwork,
        snapshot: &Snapshot,
    ) -> Result<Vec<(Arc<Network>, String, Option<Value>)>> {
        let mut targets = vec![];

        if pod.networks().is_empty() {
            for record in self.cache.list(pod.id())? {
                let network = match snapshot.lookup(record.network_name()) {
                    Ok(network) => network,
                    Err(_) => match record
                        .config_bytes()
                        .and_then(|bytes| Network::from_cached_config(record.network_name(), &bytes))
                    {
                        Ok(network) => Arc::new(network),
                        Err(e) => {
                            warn!(
                                "Skipping cached attachment {} on {}: {}",
                                record.network_name(),
                                record.if_name(),
                                chain(e)
                            );
                            continue;
                        }
                    },
                };
                targets.push((network, record.if_name().clone(), record.result().clone()));
            }
            return Ok(targets);
        }

        for (i, attachment) in pod.networks().iter().enumerate() {
            let ifname = attachment
                .ifname()
                .clone()
                .unwrap_or_else(|| format!("eth{}", i));
            let record = self.cache.get(attachment.name(), pod.id(), &ifname)?;

            let network = match snapshot.lookup(attachment.name()) {
                Ok(network) => Some(network),
                Err(_) => record.as_ref().and_then(|record| {
                    record
                        .config_bytes()
                        .and_then(|bytes| Network::from_cached_config(attachment.name(), &bytes))
                        .map(Arc::new)
                        .ok()
                }),
            };

            match network {
                Some(network) => {
                    let prev_result = record.and_then(|record| record.result().clone());
                    targets.push((network, ifname, prev_result));
                }
                None => debug!(
                    "Skipping attachment {} on {}: not in registry nor cache",
                    attachment.name(),
                    ifname
                ),
            }
        }

        Ok(targets)
    }

    /// Check all of the pod's attachments. The first failure surfaces.
    pub async fn check_pod(&self, pod: &PodNetwork) -> Result<()> {
        let _guard = self.lock_map.lock(pod.id().clone()).await;
        let snapshot = self.registry.snapshot();

        for attachment in self.resolve_attachments(pod, &snapshot)? {
            let conf = RuntimeConf::build(pod, attachment.network.name(), &attachment.ifname)?;
            let prev_result = self
                .cache
                .get(attachment.network.name(), pod.id(), &attachment.ifname)?
                .and_then(|record| record.result().clone());
            self.check_chain(&attachment.network, &conf, prev_result.as_ref())
                .await
                .with_context(|| {
                    format!(
                        "check network {} of pod {}",
                        attachment.network.name(),
                        pod.name()
                    )
                })?;
        }

        Ok(())
    }

    /// The recorded result of every attachment of the pod. Attachments
    /// without a cache record are an error.
    pub async fn pod_network_status(&self, pod: &PodNetwork) -> Result<Vec<NetResult>> {
        let _guard = self.lock_map.lock(pod.id().clone()).await;
        let snapshot = self.registry.snapshot();

        let mut results = vec![];
        for attachment in self.resolve_attachments(pod, &snapshot)? {
            let record = self
                .cache
                .get(attachment.network.name(), pod.id(), &attachment.ifname)?
                .ok_or_else(|| NetworkError::CacheMiss {
                    container_id: pod.id().clone(),
                    ifname: attachment.ifname.clone(),
                })?;
            let value = record.result().as_ref().ok_or_else(|| {
                NetworkError::CacheMiss {
                    container_id: pod.id().clone(),
                    ifname: attachment.ifname.clone(),
                }
            })?;
            results.push(NetResult::new(
                attachment.as_net_attachment(),
                CNIResult::from_value(value)?,
            ));
        }

        Ok(results)
    }

    /// Ask every GC-capable network to reconcile its host state against the
    /// provided set of live pods. Attachments naming unknown networks are
    /// dropped from the payload.
    pub async fn gc(&self, valid_pods: &[PodNetwork]) -> Result<()> {
        let snapshot = self.registry.snapshot();

        // Serialize against per-pod operations, in stable order.
        let mut pod_ids = valid_pods.iter().map(|p| p.id().clone()).collect::<Vec<_>>();
        pod_ids.sort();
        pod_ids.dedup();
        let mut guards = vec![];
        for id in pod_ids {
            guards.push(self.lock_map.lock(id).await);
        }

        let mut live: HashMap<String, Vec<Value>> = HashMap::new();
        for pod in valid_pods {
            let requested = if pod.networks().is_empty() {
                match snapshot.resolve_default(self.config.default_network_name().as_deref()) {
                    Ok(default) => vec![NetAttachment::new(default.name().clone())],
                    Err(_) => continue,
                }
            } else {
                pod.networks().clone()
            };

            for (i, attachment) in requested.iter().enumerate() {
                if !snapshot.networks().contains_key(attachment.name()) {
                    debug!(
                        "Dropping attachment of unknown network {} from GC payload",
                        attachment.name()
                    );
                    continue;
                }
                let ifname = attachment
                    .ifname()
                    .clone()
                    .unwrap_or_else(|| format!("eth{}", i));
                live.entry(attachment.name().clone()).or_default().push(json!({
                    "containerID": pod.id(),
                    "ifname": ifname,
                }));
            }
        }

        let mut first_error: Option<anyhow::Error> = None;
        for network in snapshot.networks().values() {
            if !network.supports_gc_and_status() {
                debug!(
                    "Network {} (version {}) does not support GC",
                    network.name(),
                    network.cni_version()
                );
                continue;
            }

            let valid = live.get(network.name()).cloned().unwrap_or_default();
            if let Err(e) = self.gc_chain(network, valid).await {
                warn!("GC of network {} failed: {:#}", network.name(), e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// ADD over the chain, threading each plugin's result into the next as
    /// `prevResult`. The last plugin's result is the chain result.
    async fn attach_chain(&self, network: &Network, conf: &RuntimeConf) -> Result<CNIResult> {
        let mut prev_result: Option<Value> = None;
        for plugin_conf in network.list().plugins() {
            let plugin =
                Plugin::resolve(plugin_conf.typ(), self.config.bin_dir(), self.exec.clone())?;
            let stdin = plugin_stdin(
                network,
                plugin_conf,
                conf.capability_args(),
                prev_result.as_ref(),
                &[],
            )?;
            let result = plugin
                .add(conf.invoke(), &stdin)
                .await
                .with_context(|| format!("ADD of plugin {}", plugin_conf.typ()))?;
            prev_result =
                Some(serde_json::to_value(&result).context("serialize plugin result")?);
        }

        match prev_result {
            Some(value) => CNIResult::from_value(&value),
            None => Ok(CNIResult::default()),
        }
    }

    /// DEL over the chain in reverse order. Every plugin is attempted; the
    /// first error is returned afterwards.
    async fn detach_chain(
        &self,
        network: &Network,
        conf: &RuntimeConf,
        prev_result: Option<&Value>,
    ) -> Result<()> {
        let mut first_error: Option<anyhow::Error> = None;
        for plugin_conf in network.list().plugins().iter().rev() {
            let outcome = match Plugin::resolve(
                plugin_conf.typ(),
                self.config.bin_dir(),
                self.exec.clone(),
            ) {
                Ok(plugin) => {
                    match plugin_stdin(
                        network,
                        plugin_conf,
                        conf.capability_args(),
                        prev_result,
                        &[],
                    ) {
                        Ok(stdin) => plugin.del(conf.invoke(), &stdin).await,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                error!(
                    "DEL of plugin {} for network {} failed: {}",
                    plugin_conf.typ(),
                    network.name(),
                    e
                );
                first_error.get_or_insert(e.context(format!(
                    "DEL of plugin {}",
                    plugin_conf.typ()
                )));
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// CHECK over the chain in order, honoring `disableCheck`.
    async fn check_chain(
        &self,
        network: &Network,
        conf: &RuntimeConf,
        prev_result: Option<&Value>,
    ) -> Result<()> {
        if network.list().disable_check() == &Some(true) {
            debug!("Check disabled for network {}", network.name());
            return Ok(());
        }

        for plugin_conf in network.list().plugins() {
            let plugin =
                Plugin::resolve(plugin_conf.typ(), self.config.bin_dir(), self.exec.clone())?;
            let stdin = plugin_stdin(
                network,
                plugin_conf,
                conf.capability_args(),
                prev_result,
                &[],
            )?;
            plugin
                .check(conf.invoke(), &stdin)
                .await
                .with_context(|| format!("CHECK of plugin {}", plugin_conf.typ()))?;
        }

        Ok(())
    }

    /// GC over the chain, handing every plugin the valid attachment set.
    async fn gc_chain(&self, network: &Network, valid: Vec<Value>) -> Result<()> {
        let extra = [(GC_VALID_ATTACHMENTS_KEY, Value::Array(valid))];
        for plugin_conf in network.list().plugins() {
            let plugin =
                Plugin::resolve(plugin_conf.typ(), self.config.bin_dir(), self.exec.clone())?;
            let stdin = plugin_stdin(network, plugin_conf, &Map::new(), None, &extra)?;
            plugin
                .gc(&stdin)
                .await
                .with_context(|| format!("GC of plugin {}", plugin_conf.typ()))?;
        }
        Ok(())
    }
}

impl Drop for CNI {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Assemble one plugin's stdin: its own configuration augmented with the
/// chain name and version, the capability args the plugin declares, the
/// previous plugin's result and any verb-specific keys.
fn plugin_stdin(
    network: &Network,
    plugin_conf: &ConfigFile,
    capability_args: &Map<String, Value>,
    prev_result: Option<&Value>,
    extra: &[(&str, Value)],
) -> Result<Vec<u8>> {
    let mut object = match serde_json::to_value(plugin_conf).context("serialize plugin config")? {
        Value::Object(object) => object,
        _ => bail!("plugin config is not a JSON object"),
    };

    object.insert("name".into(), Value::from(network.name().as_str()));
    object.insert("cniVersion".into(), Value::from(network.cni_version()));

    let declared = plugin_conf.capabilities();
    let filtered = capability_args
        .iter()
        .filter(|(name, _)| {
            declared
                .as_ref()
                .map_or(false, |capabilities| capabilities.get(*name) == Some(&true))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect::<Map<_, _>>();
    if !filtered.is_empty() {
        object.insert("runtimeConfig".into(), Value::Object(filtered));
    }

    if let Some(prev) = prev_result {
        object.insert("prevResult".into(), prev.clone());
    }

    for (key, value) in extra {
        object.insert((*key).into(), value.clone());
    }

    serde_json::to_vec(&Value::Object(object)).context("serialize plugin stdin")
}
