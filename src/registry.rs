//! Thread-safe registry of loaded networks.

use crate::{
    error::NetworkError,
    loader::{LoadedNetworks, Network},
};
use anyhow::{format_err, Result};
use getset::Getters;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Debug, Default, Getters)]
/// An immutable view of the loaded networks as of some instant. Published
/// wholesale; never mutated in place.
pub struct Snapshot {
    #[get = "pub"]
    /// All loaded networks keyed by name.
    networks: HashMap<String, Arc<Network>>,

    #[get = "pub"]
    /// The first network by configuration filename order, used as the
    /// default when none was configured.
    first_name: Option<String>,
}

impl Snapshot {
    /// Look up a network by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<Network>> {
        self.networks
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownNetwork(name.into()).into())
    }

    /// Resolve the default network: the user-configured name when given,
    /// otherwise the first network in filename order.
    pub fn resolve_default(&self, configured: Option<&str>) -> Result<Arc<Network>> {
        if self.networks.is_empty() {
            return Err(NetworkError::NotReady("no networks loaded".into()).into());
        }
        let name = match configured {
            Some(name) => name,
            None => self.first_name.as_deref().ok_or_else(|| {
                format_err!("no candidate default network despite non-empty registry")
            })?,
        };
        self.networks.get(name).cloned().ok_or_else(|| {
            NetworkError::NotReady(format!("default network {} not found", name)).into()
        })
    }
}

impl From<LoadedNetworks> for Snapshot {
    fn from(loaded: LoadedNetworks) -> Self {
        Self {
            networks: loaded.networks,
            first_name: loaded.first_name,
        }
    }
}

#[derive(Debug, Default)]
/// Shared holder of the current `Snapshot`. Readers copy the pointer under
/// a short critical section; writers swap it atomically.
pub struct Registry(RwLock<Arc<Snapshot>>);

impl Registry {
    /// The current snapshot. Remains consistent for as long as the caller
    /// holds it, regardless of concurrent swaps.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.0.read().expect("registry lock poisoned").clone()
    }

    /// Atomically publish a new snapshot.
    pub fn replace(&self, snapshot: Snapshot) {
        *self.0.write().expect("registry lock poisoned") = Arc::new(snapshot);
    }
}
