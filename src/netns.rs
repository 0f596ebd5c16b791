//! Loopback management inside pod network namespaces.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::executor;
use futures_util::stream::TryStreamExt;
use log::trace;
use nix::sched::{setns, CloneFlags};
use std::{
    fs::File,
    os::unix::io::{AsRawFd, RawFd},
    path::Path,
};
use tokio::task;

/// The network namespace of the calling thread.
const HOST_NETNS: &str = "/proc/thread-self/ns/net";

#[async_trait]
/// Brings the loopback interface of a pod network namespace up.
pub trait Loopback: Send + Sync {
    async fn up(&self, netns_path: &Path) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
/// Loopback management via a netlink socket opened inside the pod netns.
pub struct DefaultLoopback;

#[async_trait]
impl Loopback for DefaultLoopback {
    async fn up(&self, netns_path: &Path) -> Result<()> {
        let host = File::open(HOST_NETNS).context("open host network namespace")?;
        let pod = File::open(netns_path)
            .with_context(|| format!("open pod network namespace {}", netns_path.display()))?;

        // The blocking thread is shared with the rest of the runtime, so it
        // must land back in the host namespace whichever way the netlink
        // calls end.
        task::spawn_blocking(move || {
            enter_netns(pod.as_raw_fd()).context("enter pod network namespace")?;
            let result = executor::block_on(set_loopback_up());
            enter_netns(host.as_raw_fd()).context("return to host network namespace")?;
            result
        })
        .await
        .context("join loopback thread")?
        .context("bring up loopback inside pod namespace")
    }
}

/// Move the calling thread into the network namespace behind `fd`.
fn enter_netns(fd: RawFd) -> Result<()> {
    trace!("Switching thread network namespace");
    setns(fd, CloneFlags::CLONE_NEWNET).context("setns")?;
    Ok(())
}

/// Find the loopback link and set it administratively up.
async fn set_loopback_up() -> Result<()> {
    let (connection, handle, _) =
        rtnetlink::new_connection().context("create netlink connection")?;
    tokio::spawn(connection);

    let link = handle
        .link()
        .get()
        .set_name_filter("lo".into())
        .execute()
        .try_next()
        .await
        .context("query loopback link")?
        .context("no loopback link in pod namespace")?;

    handle
        .link()
        .set(link.header.index)
        .up()
        .execute()
        .await
        .context("set loopback link up")
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Records loopback invocations instead of touching a namespace.
    #[derive(Default)]
    pub struct LoopbackMock {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl LoopbackMock {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Loopback for LoopbackMock {
        async fn up(&self, _netns_path: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("loopback failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn up_failure_missing_netns() {
        let err = DefaultLoopback
            .up(Path::new("/does/not/exist"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("pod network namespace"));
    }

    #[test]
    fn host_netns_is_openable() -> Result<()> {
        File::open(HOST_NETNS)?;
        Ok(())
    }
}
