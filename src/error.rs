//! Error handling helpers and primitives.

use anyhow::Error;
use thiserror::Error as ThisError;

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[derive(Debug, ThisError)]
/// Distinguishable failure kinds of network operations. Carried inside
/// `anyhow::Error` stacks so callers can `downcast_ref` on the kind.
pub enum NetworkError {
    #[error("network is not ready: {0}")]
    /// The registry is empty, the default network is missing, a required
    /// plugin binary is unresolved or the last STATUS probe failed.
    NotReady(String),

    #[error("network {0} not found")]
    /// An attachment referenced a name absent from the current snapshot.
    UnknownNetwork(String),

    #[error("invalid runtime config: {0}")]
    /// Per-pod runtime options failed validation before any plugin ran.
    InvalidRuntimeConfig(String),

    #[error("plugin error (code {code}): {message}")]
    /// A plugin reported an error object on stdout.
    Plugin { code: u64, message: String },

    #[error("partial setup of network {network}, unwind attempted: {message}")]
    /// An ADD failed mid-setup; every prior attachment was DELed in reverse
    /// order before this was returned.
    PartialSetup { network: String, message: String },

    #[error("no cached attachment for container {container_id} on {ifname}")]
    /// No on-disk record exists for the attachment. Benign on teardown.
    CacheMiss { container_id: String, ifname: String },
}

impl NetworkError {
    /// Returns true for conditions teardown swallows.
    pub fn is_benign_on_teardown(&self) -> bool {
        matches!(self, NetworkError::CacheMiss { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn downcast_kind() {
        let err: Error = NetworkError::UnknownNetwork("net".into()).into();
        let err = err.context("lookup network");

        match err.downcast_ref::<NetworkError>() {
            Some(NetworkError::UnknownNetwork(name)) => assert_eq!(name, "net"),
            _ => panic!("wrong error kind"),
        }
    }

    #[test]
    fn benign_on_teardown() {
        let miss = NetworkError::CacheMiss {
            container_id: "id".into(),
            ifname: "eth0".into(),
        };
        assert!(miss.is_benign_on_teardown());
        assert!(!NetworkError::NotReady("empty".into()).is_benign_on_teardown());
    }
}
