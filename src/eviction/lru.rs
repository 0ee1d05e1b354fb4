//! LRU Replacement Strategy
//!
//! Reference [`Strategy`] implementation: entries ordered by recency, with
//! the most recently used at the front. Victims are taken from the back.
//!
//! Recency is a monotonically increasing sequence number; the order index
//! maps sequence → key so the coldest entries enumerate first. All state
//! sits behind a single mutex.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::{Strategy, Victim};

#[derive(Debug)]
struct LruEntry {
    seq: u64,
    size: u64,
}

#[derive(Default)]
struct LruInner {
    next_seq: u64,
    entries: HashMap<String, LruEntry>,
    /// seq → key, ascending seq = least recently used first.
    order: BTreeMap<u64, String>,
}

impl LruInner {
    fn bump(&mut self, key: &str) -> Option<u64> {
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.seq);
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.order.insert(entry.seq, key.to_string());
        Some(entry.size)
    }
}

/// Least-recently-used strategy.
pub struct LruStrategy {
    inner: Mutex<LruInner>,
}

impl LruStrategy {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner::default()),
        }
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

impl Default for LruStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LruStrategy {
    fn on_add(&self, key: &str, size: u64) -> i64 {
        let mut inner = self.inner.lock();
        if let Some(old_size) = inner.bump(key) {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.size = size;
            }
            size as i64 - old_size as i64
        } else {
            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.entries.insert(key.to_string(), LruEntry { seq, size });
            inner.order.insert(seq, key.to_string());
            size as i64
        }
    }

    fn on_access(&self, key: &str) {
        self.inner.lock().bump(key);
    }

    fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            inner.order.remove(&entry.seq);
        }
    }

    fn victims(&self, current_size: u64, target_size: u64) -> Vec<Victim> {
        let inner = self.inner.lock();
        let mut victims = Vec::new();
        let mut size = current_size;

        for key in inner.order.values() {
            if size <= target_size {
                break;
            }
            if let Some(entry) = inner.entries.get(key) {
                victims.push(Victim {
                    key: key.clone(),
                    size: entry.size,
                });
                size = size.saturating_sub(entry.size);
            }
        }

        victims
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victims_lru_order() {
        let lru = LruStrategy::new();

        lru.on_add("a", 10);
        lru.on_add("b", 20);
        lru.on_add("c", 30);

        // Recency is now c, b, a (most recent first). Touch a.
        lru.on_access("a");
        // Recency: a, c, b.

        // Current 60, target 40: removing b (20) suffices.
        let victims = lru.victims(60, 40);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, "b");

        // Current 60, target 10: b (→40), then c (→10).
        let victims = lru.victims(60, 10);
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].key, "b");
        assert_eq!(victims[1].key, "c");
    }

    #[test]
    fn test_victims_scan_is_non_destructive() {
        let lru = LruStrategy::new();
        lru.on_add("a", 10);

        let first = lru.victims(10, 0);
        let second = lru.victims(10, 0);
        assert_eq!(first, second);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn test_on_add_new_key_returns_size() {
        let lru = LruStrategy::new();
        assert_eq!(lru.on_add("a", 42), 42);
    }

    #[test]
    fn test_on_add_existing_key_returns_delta() {
        let lru = LruStrategy::new();
        lru.on_add("a", 10);
        assert_eq!(lru.on_add("a", 25), 15);
        assert_eq!(lru.on_add("a", 5), -20);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn test_on_add_existing_key_moves_to_front() {
        let lru = LruStrategy::new();
        lru.on_add("a", 10);
        lru.on_add("b", 10);
        // Re-adding a makes b the coldest.
        lru.on_add("a", 10);

        let victims = lru.victims(20, 10);
        assert_eq!(victims[0].key, "b");
    }

    #[test]
    fn test_remove() {
        let lru = LruStrategy::new();
        lru.on_add("a", 10);
        lru.remove("a");

        assert!(lru.victims(10, 0).is_empty());
        assert!(lru.is_empty());

        // Removing a missing key is a no-op.
        lru.remove("a");
    }

    #[test]
    fn test_access_unknown_key_is_noop() {
        let lru = LruStrategy::new();
        lru.on_access("ghost");
        assert!(lru.is_empty());
    }
}
