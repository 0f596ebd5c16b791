//! Reference-counted per-key lock table.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

struct Entry {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

#[derive(Default)]
/// A table of per-key async mutexes. Operations on the same key serialize,
/// operations on different keys run in parallel. An entry exists only while
/// at least one holder or waiter references it.
pub struct LockMap<K: Hash + Eq> {
    inner: std::sync::Mutex<HashMap<K, Entry>>,
}

/// Holds the per-key mutex. Dropping the guard unlocks the key and removes
/// the table entry when this was its last user.
pub struct LockMapGuard<'m, K: Hash + Eq> {
    map: &'m LockMap<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Hash + Eq> Drop for LockMapGuard<'_, K> {
    fn drop(&mut self) {
        // Unlock before touching the refcount so a waiter can proceed as
        // soon as the table lock is released.
        self.guard.take();

        let mut map = self.map.inner.lock().expect("lock map poisoned");
        if let Some(entry) = map.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(&self.key);
            }
        }
    }
}

impl<K: Hash + Eq + Clone> LockMap<K> {
    /// Register interest in `key` and return its mutex. The refcount is
    /// bumped under the table lock so the entry cannot vanish while this
    /// caller waits on it.
    fn register(&self, key: K) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map poisoned");
        let entry = map.entry(key).or_insert_with(|| Entry {
            mutex: Arc::new(Mutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        entry.mutex.clone()
    }

    /// Acquire the lock for `key`, waiting until any current holder drops
    /// its guard.
    pub async fn lock(&self, key: K) -> LockMapGuard<'_, K> {
        let guard = self.register(key.clone()).lock_owned().await;
        LockMapGuard {
            map: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("lock map poisoned").len()
    }
}
