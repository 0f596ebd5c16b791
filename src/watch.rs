//! Directory change monitoring with debounce and periodic resync.

use anyhow::{Context, Result};
use crossbeam_channel::{RecvTimeoutError, Sender};
use log::{debug, error, trace, warn};
use notify::{
    Error as NotifyError, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::{path::Path, result, thread, time::Duration};

/// Selector for watcher messages on the receiver channel.
pub enum WatcherMessage {
    Handle(result::Result<Event, NotifyError>),
    Exit,
}

/// Watches a set of directories and invokes a resync callback on change,
/// coalescing event bursts, plus unconditionally at a fixed interval so
/// dropped filesystem events cannot leave the consumer stale.
pub struct Monitor {
    tx: Sender<WatcherMessage>,
    thread: Option<thread::JoinHandle<()>>,
    // Kept alive for the lifetime of the monitor.
    _watcher: RecommendedWatcher,
}

impl Monitor {
    /// Watch `dirs` and run `resync` on debounced changes and every
    /// `resync_interval`. The watcher itself is advisory; directories that
    /// vanish detach silently and the periodic resync covers the gap.
    pub fn spawn<P, F>(
        dirs: &[P],
        debounce: Duration,
        resync_interval: Duration,
        resync: F,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();

        let tx_clone = tx.clone();
        let mut watcher: RecommendedWatcher = RecommendedWatcher::new(move |event| {
            // A send failure means the monitor is already gone.
            let _ = tx_clone.send(WatcherMessage::Handle(event));
        })
        .context("create directory watcher")?;

        for dir in dirs {
            let dir = dir.as_ref();
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!("Unable to watch path {}: {}", dir.display(), e);
            }
        }

        let thread = thread::spawn(move || loop {
            match rx.recv_timeout(resync_interval) {
                Ok(WatcherMessage::Exit) => {
                    debug!("Stopped monitor thread");
                    return;
                }
                Ok(WatcherMessage::Handle(Ok(event))) if Self::is_change(&event) => {
                    trace!("Got file watcher event: {:?}", &event);
                    // Coalesce the burst before resyncing.
                    loop {
                        match rx.recv_timeout(debounce) {
                            Ok(WatcherMessage::Exit) => return,
                            Ok(_) => continue,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    resync();
                }
                Ok(WatcherMessage::Handle(Ok(_))) => {}
                Ok(WatcherMessage::Handle(Err(e))) => {
                    error!("Watch error, awaiting periodic resync: {}", e)
                }
                Err(RecvTimeoutError::Timeout) => resync(),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        });

        Ok(Self {
            tx,
            thread: Some(thread),
            _watcher: watcher,
        })
    }

    /// Returns true for events that can change directory contents.
    fn is_change(event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        )
    }

    /// Stop the monitor and wait for its thread to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(WatcherMessage::Exit);
            if thread.join().is_err() {
                error!("Monitor thread panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        fs,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tempfile::TempDir;

    fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn resync_on_file_creation() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let mut monitor = Monitor::spawn(
            &[temp_dir.path()],
            Duration::from_millis(20),
            Duration::from_secs(60),
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
        )?;

        fs::write(temp_dir.path().join("10-test.conf"), "{}")?;

        assert!(wait_for(
            || count.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));

        monitor.stop();
        Ok(())
    }

    #[test]
    fn periodic_resync_without_events() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let mut monitor = Monitor::spawn(
            &[temp_dir.path()],
            Duration::from_millis(20),
            Duration::from_millis(50),
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
        )?;

        assert!(wait_for(
            || count.load(Ordering::SeqCst) >= 2,
            Duration::from_secs(5)
        ));

        monitor.stop();
        Ok(())
    }

    #[test]
    fn burst_is_debounced() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let mut monitor = Monitor::spawn(
            &[temp_dir.path()],
            Duration::from_millis(200),
            Duration::from_secs(60),
            move || {
                count_clone.fetch_add(1, Ordering::SeqCst);
            },
        )?;

        for i in 0..10 {
            fs::write(temp_dir.path().join(format!("{}.conf", i)), "{}")?;
        }

        assert!(wait_for(
            || count.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        // The burst collapses into far fewer resyncs than events.
        thread::sleep(Duration::from_millis(300));
        assert!(count.load(Ordering::SeqCst) <= 3);

        monitor.stop();
        Ok(())
    }

    #[test]
    fn stop_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut monitor = Monitor::spawn(
            &[temp_dir.path()],
            Duration::from_millis(20),
            Duration::from_secs(60),
            || {},
        )?;

        monitor.stop();
        monitor.stop();
        Ok(())
    }

    #[test]
    fn missing_dir_is_not_fatal() -> Result<()> {
        let mut monitor = Monitor::spawn(
            &[Path::new("/does/not/exist")],
            Duration::from_millis(20),
            Duration::from_secs(60),
            || {},
        )?;
        monitor.stop();
        Ok(())
    }
}
