//! Eviction Manager
//!
//! Owns the byte accounting for the cache directory and the periodic
//! eviction tick. Reads and writes keep flowing while a tick runs: every
//! accounting mutation goes through one atomic counter and the strategy's
//! own lock, and a tick never overlaps itself.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{Policy, Strategy};
use crate::repository::LocalStore;

pub struct EvictionManager {
    policies: Vec<Box<dyn Policy>>,
    strategy: Arc<dyn Strategy>,
    current_bytes: AtomicI64,
    interval: Duration,
}

impl EvictionManager {
    pub fn new(
        policies: Vec<Box<dyn Policy>>,
        strategy: Arc<dyn Strategy>,
        interval: Duration,
    ) -> Self {
        Self {
            policies,
            strategy,
            current_bytes: AtomicI64::new(0),
            interval,
        }
    }

    /// Seed accounting from a startup walk of the store.
    pub fn seed(&self, entries: impl IntoIterator<Item = (String, u64)>) {
        let mut total: i64 = 0;
        let mut count: u64 = 0;
        for (key, size) in entries {
            total += self.strategy.on_add(&key, size);
            count += 1;
        }
        self.current_bytes.store(total, Ordering::SeqCst);
        info!(count, size = total, "initial cache state loaded");
    }

    /// Record a committed write.
    pub fn add(&self, key: &str, size: u64) {
        let diff = self.strategy.on_add(key, size);
        self.current_bytes.fetch_add(diff, Ordering::SeqCst);
    }

    /// Record a read.
    pub fn touch(&self, key: &str) {
        self.strategy.on_access(key);
    }

    /// Current tracked cache size in bytes.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::SeqCst).max(0) as u64
    }

    /// Run the background eviction loop until the task is dropped.
    pub fn start(self: Arc<Self>, store: Arc<LocalStore>) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would re-run what seed() just did.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_eviction(&store);
            }
        })
    }

    /// One eviction tick: consult policies, select victims, delete them.
    pub fn run_eviction(&self, store: &LocalStore) {
        let current = self.current_bytes();

        let mut max_to_free: u64 = 0;
        for policy in &self.policies {
            match policy.bytes_to_free(current) {
                Ok(to_free) => max_to_free = max_to_free.max(to_free),
                Err(e) => error!(error = %e, "capacity policy check failed"),
            }
        }
        if max_to_free == 0 {
            return;
        }

        let target = current.saturating_sub(max_to_free);
        let victims = self.strategy.victims(current, target);
        if victims.is_empty() {
            return;
        }

        info!(
            count = victims.len(),
            current_size = current,
            to_free = max_to_free,
            target,
            "evicting files"
        );

        for victim in victims {
            let deleted = match store.delete(&victim.key) {
                Ok(()) => true,
                Err(e) => {
                    // Drop the key from the strategy anyway so an
                    // un-deletable file cannot block progress forever.
                    warn!(key = %victim.key, error = %e, "failed to remove victim; leaking entry");
                    false
                }
            };

            self.strategy.remove(&victim.key);
            if deleted {
                self.current_bytes
                    .fetch_sub(victim.size as i64, Ordering::SeqCst);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::{LruStrategy, MaxSizePolicy};
    use crate::hashing::Algorithm;

    const HASHES: [&str; 4] = [
        "1111111111111111111111111111111111111111",
        "2222222222222222222222222222222222222222",
        "3333333333333333333333333333333333333333",
        "4444444444444444444444444444444444444444",
    ];

    async fn put_file(store: &LocalStore, hash: &str, size: usize) {
        let mut writer = store.begin_write(Algorithm::Sha1, hash).await.unwrap();
        writer.write_all(&vec![0u8; size]).await.unwrap();
        writer.commit().await.unwrap();
    }

    fn committed_count(store: &LocalStore) -> usize {
        store.walk().unwrap().len()
    }

    #[tokio::test]
    async fn test_tick_respects_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(EvictionManager::new(
            vec![Box::new(MaxSizePolicy { max_bytes: 50 })],
            Arc::new(LruStrategy::new()),
            Duration::from_secs(60),
        ));
        let store = Arc::new(LocalStore::new(dir.path(), Some(Arc::clone(&manager))));

        for hash in &HASHES[..3] {
            put_file(&store, hash, 20).await;
        }
        assert_eq!(manager.current_bytes(), 60);

        manager.run_eviction(&store);

        // 60 > 50: exactly the oldest file goes, leaving 40.
        assert_eq!(committed_count(&store), 2);
        assert_eq!(manager.current_bytes(), 40);
        assert!(!store.exists(Algorithm::Sha1, HASHES[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_tick_is_noop_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(EvictionManager::new(
            vec![Box::new(MaxSizePolicy { max_bytes: 100 })],
            Arc::new(LruStrategy::new()),
            Duration::from_secs(60),
        ));
        let store = Arc::new(LocalStore::new(dir.path(), Some(Arc::clone(&manager))));

        put_file(&store, HASHES[0], 20).await;
        manager.run_eviction(&store);

        assert_eq!(committed_count(&store), 1);
        assert_eq!(manager.current_bytes(), 20);
    }

    #[tokio::test]
    async fn test_add_after_eviction_triggers_next_round() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(EvictionManager::new(
            vec![Box::new(MaxSizePolicy { max_bytes: 50 })],
            Arc::new(LruStrategy::new()),
            Duration::from_secs(60),
        ));
        let store = Arc::new(LocalStore::new(dir.path(), Some(Arc::clone(&manager))));

        for hash in &HASHES[..3] {
            put_file(&store, hash, 20).await;
        }
        manager.run_eviction(&store);
        assert_eq!(committed_count(&store), 2);

        put_file(&store, HASHES[3], 20).await;
        assert_eq!(manager.current_bytes(), 60);

        manager.run_eviction(&store);
        assert_eq!(committed_count(&store), 2);
        assert_eq!(manager.current_bytes(), 40);
    }

    #[tokio::test]
    async fn test_touch_protects_entry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(EvictionManager::new(
            vec![Box::new(MaxSizePolicy { max_bytes: 50 })],
            Arc::new(LruStrategy::new()),
            Duration::from_secs(60),
        ));
        let store = Arc::new(LocalStore::new(dir.path(), Some(Arc::clone(&manager))));

        for hash in &HASHES[..3] {
            put_file(&store, hash, 20).await;
        }

        // Reading the oldest file moves it to the front; the second-oldest
        // becomes the victim.
        store.open_read(Algorithm::Sha1, HASHES[0]).await.unwrap();
        manager.run_eviction(&store);

        assert!(store.exists(Algorithm::Sha1, HASHES[0]).await.unwrap());
        assert!(!store.exists(Algorithm::Sha1, HASHES[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_seed_from_walk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let plain = LocalStore::new(dir.path(), None);
            put_file(&plain, HASHES[0], 15).await;
            put_file(&plain, HASHES[1], 25).await;
        }

        let manager = Arc::new(EvictionManager::new(
            Vec::new(),
            Arc::new(LruStrategy::new()),
            Duration::from_secs(60),
        ));
        let store = Arc::new(LocalStore::new(dir.path(), Some(Arc::clone(&manager))));
        manager.seed(store.walk().unwrap());

        assert_eq!(manager.current_bytes(), 40);
    }

    #[tokio::test]
    async fn test_missing_victim_file_still_decrements() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(EvictionManager::new(
            vec![Box::new(MaxSizePolicy { max_bytes: 0 })],
            Arc::new(LruStrategy::new()),
            Duration::from_secs(60),
        ));
        let store = Arc::new(LocalStore::new(dir.path(), Some(Arc::clone(&manager))));

        put_file(&store, HASHES[0], 20).await;
        // The file vanishes behind the manager's back; delete is idempotent
        // so the tick treats it as gone.
        store.delete(&LocalStore::key(Algorithm::Sha1, HASHES[0])).unwrap();

        manager.run_eviction(&store);
        assert_eq!(manager.current_bytes(), 0);
    }
}
