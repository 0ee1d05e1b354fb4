//! Single-Flight Fill Coordination
//!
//! For each digest currently being fetched, a transient record pins a single
//! leader; all concurrent callers for the same key wait on that leader and
//! then re-check the cache. No two fills for the same key are ever live
//! simultaneously.
//!
//! The table holds no lock across I/O: joining is a single map operation and
//! waiting happens on a watch channel outside the map.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

/// Outcome slot: `None` while the leader is working, `Some(success)` after.
type Outcome = watch::Receiver<Option<bool>>;

/// Table of in-flight fills keyed by `{algo}:{hash}`.
#[derive(Clone, Default)]
pub struct FillTable {
    inflight: Arc<DashMap<String, Outcome>>,
}

/// Result of joining a fill.
pub enum Flight {
    /// This caller owns the fill and must run it to completion.
    Leader(FillGuard),
    /// Another caller is already filling; await the outcome.
    Follower(Outcome),
}

impl FillTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the fill for `key`, becoming the leader if none is live.
    pub fn join(&self, key: &str) -> Flight {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(occupied) => Flight::Follower(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                Flight::Leader(FillGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: key.to_string(),
                    tx,
                    completed: false,
                })
            }
        }
    }

    /// Number of fills currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

/// Leader-side handle for an in-flight fill.
///
/// Dropping the guard without calling [`FillGuard::complete`] counts as a
/// failed fill, so leaders that panic or bail early never strand followers.
pub struct FillGuard {
    inflight: Arc<DashMap<String, Outcome>>,
    key: String,
    tx: watch::Sender<Option<bool>>,
    completed: bool,
}

impl FillGuard {
    /// Publish the fill outcome and retire the in-flight record.
    pub fn complete(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        // Retire the record first so late arrivals start a fresh flight
        // (they will re-check the cache before fetching anything).
        self.inflight.remove(&self.key);
        let _ = self.tx.send(Some(success));
    }
}

impl Drop for FillGuard {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Await the leader's outcome. Returns whether the fill succeeded.
pub async fn wait(mut outcome: Outcome) -> bool {
    loop {
        if let Some(success) = *outcome.borrow() {
            return success;
        }
        if outcome.changed().await.is_err() {
            // Leader vanished; its Drop published a final value.
            return (*outcome.borrow()).unwrap_or(false);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_single_leader_many_followers() {
        let table = FillTable::new();
        let leaders = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            let leaders = Arc::clone(&leaders);
            handles.push(tokio::spawn(async move {
                match table.join("sha256:abc") {
                    Flight::Leader(guard) => {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        guard.complete(true);
                        true
                    }
                    Flight::Follower(outcome) => wait(outcome).await,
                }
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap(), "every caller observes success");
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_followers_observe_failure() {
        let table = FillTable::new();

        let guard = match table.join("sha256:def") {
            Flight::Leader(g) => g,
            Flight::Follower(_) => panic!("first join must lead"),
        };
        let follower = match table.join("sha256:def") {
            Flight::Follower(outcome) => outcome,
            Flight::Leader(_) => panic!("second join must follow"),
        };

        guard.complete(false);
        assert!(!wait(follower).await);
    }

    #[tokio::test]
    async fn test_dropped_guard_counts_as_failure() {
        let table = FillTable::new();

        let guard = match table.join("sha1:xyz") {
            Flight::Leader(g) => g,
            Flight::Follower(_) => panic!("first join must lead"),
        };
        let follower = match table.join("sha1:xyz") {
            Flight::Follower(outcome) => outcome,
            Flight::Leader(_) => panic!("second join must follow"),
        };

        drop(guard);
        assert!(!wait(follower).await);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_flight_after_completion() {
        let table = FillTable::new();

        match table.join("k") {
            Flight::Leader(guard) => guard.complete(true),
            Flight::Follower(_) => panic!("expected leader"),
        }

        // The record is retired, so the next join leads again.
        assert!(matches!(table.join("k"), Flight::Leader(_)));
    }
}
