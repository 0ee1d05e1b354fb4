//! Cache Eviction
//!
//! Pluggable capacity policies feed a pluggable replacement strategy over a
//! shared byte-accounted view of the cache directory:
//!
//! ```text
//! Policies (how much to free) → Manager (accounting, tick) → Strategy (whom to evict)
//! ```
//!
//! Strategies are registered by name so new implementations plug in without
//! touching call sites.

pub mod lru;
pub mod manager;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

pub use lru::LruStrategy;
pub use manager::EvictionManager;
pub use policy::{MaxSizePolicy, MinFreeSpacePolicy, Policy};

/// A file selected for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    /// Relative store key.
    pub key: String,
    /// On-disk size in bytes.
    pub size: u64,
}

/// Replacement strategy over the cache's entries.
///
/// Implementations serialize their own mutations; callers never hold a lock
/// across strategy calls.
pub trait Strategy: Send + Sync {
    /// Record a new or updated entry. Returns the change in tracked bytes:
    /// the full size for new keys, `new - old` for updated ones.
    fn on_add(&self, key: &str, size: u64) -> i64;

    /// Record an access to an entry.
    fn on_access(&self, key: &str);

    /// Forget an entry (evicted or deleted externally).
    fn remove(&self, key: &str);

    /// Select victims whose removal drops `current_size` to at most
    /// `target_size`. The scan is non-destructive: the caller invokes
    /// [`Strategy::remove`] per victim it actually processes.
    fn victims(&self, current_size: u64, target_size: u64) -> Vec<Victim>;
}

/// Factory type for registered strategies.
pub type StrategyFactory = fn() -> Arc<dyn Strategy>;

/// Name → strategy factory registry.
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in strategies ("lru").
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("lru", || Arc::new(LruStrategy::new()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: StrategyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate the strategy with the given name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Strategy>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| Error::StrategyNotFound(name.to_string()))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_lru() {
        let registry = StrategyRegistry::with_defaults();
        let strategy = registry.get("lru").unwrap();
        assert_eq!(strategy.on_add("a", 10), 10);
    }

    #[test]
    fn test_registry_unknown_strategy() {
        let registry = StrategyRegistry::with_defaults();
        assert!(matches!(
            registry.get("mru"),
            Err(Error::StrategyNotFound(_))
        ));
    }

    #[test]
    fn test_registry_accepts_new_strategies() {
        let mut registry = StrategyRegistry::new();
        registry.register("lru2", || Arc::new(LruStrategy::new()));
        assert!(registry.get("lru2").is_ok());
        assert!(registry.get("lru").is_err());
    }
}
