//! Per-namespace advisory locks for the embedded backend.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use store_driver::publish_lock_key;

/// Registry of publish locks, keyed by `publish_lock_key(name)`.
///
/// Entries are created on first use and never removed; the number of
/// entries is bounded by the number of distinct namespaces. Clones share
/// the same set of locks.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    locks: Arc<Mutex<HashMap<u64, Arc<AsyncMutex<()>>>>>,
}

impl LockRegistry {
    /// Create an empty registry, independent from every other registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: u64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key).or_default())
    }

    /// Wait until the lock for `name` is free and take it.
    pub async fn acquire(&self, name: &str) -> PublishGuard {
        let key = publish_lock_key(name);
        let lock = self.entry(key);
        tracing::trace!(%name, key, "waiting for publish lock");
        let guard = lock.lock_owned().await;
        tracing::trace!(%name, key, "acquired publish lock");
        PublishGuard { key, _guard: guard }
    }

    /// Number of distinct lock keys created so far.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no lock has been taken yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A held publish lock. Dropping the guard releases the lock.
pub struct PublishGuard {
    key: u64,
    _guard: OwnedMutexGuard<()>,
}

impl PublishGuard {
    /// The lock key, `publish_lock_key(name)`.
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl fmt::Debug for PublishGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishGuard").field("key", &self.key).finish()
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        tracing::trace!(key = self.key, "released publish lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_serializes() {
        let locks = LockRegistry::new();
        let guard = locks.acquire("io.example/foo").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("io.example/foo").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        let second = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("lock released")
            .unwrap();
        assert_eq!(second.key(), publish_lock_key("io.example/foo"));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn different_names_do_not_block() {
        let locks = LockRegistry::new();
        let _foo = locks.acquire("io.example/foo").await;
        let bar = tokio::time::timeout(Duration::from_millis(100), locks.acquire("io.example/bar"))
            .await
            .expect("independent lock");
        assert_ne!(bar.key(), publish_lock_key("io.example/foo"));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn registries_are_isolated() {
        let first = LockRegistry::new();
        let second = LockRegistry::new();
        let _held = first.acquire("io.example/foo").await;
        tokio::time::timeout(Duration::from_millis(100), second.acquire("io.example/foo"))
            .await
            .expect("separate registries never contend");
    }
}
