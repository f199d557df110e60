//! Predicate memoization table.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::applicability::Applicability;

/// A keyed memoization table for predicate results.
///
/// Rules opt in by declaring a [`CacheSpec`](crate::metadata::CacheSpec);
/// the key is caller-declared and independent of rule identity, so several
/// rules sharing one expensive predicate can intentionally share a slot.
///
/// The table is internally consistent under concurrent access; it is purely
/// a performance optimization and never changes engine results.
#[derive(Debug, Default)]
pub struct PredicateCache {
    entries: RwLock<HashMap<String, Applicability>>,
}

impl PredicateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached predicate result.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Applicability> {
        self.entries.read().get(key).copied()
    }

    /// Store a predicate result.
    pub fn insert(&self, key: impl Into<String>, value: Applicability) {
        self.entries.write().insert(key.into(), value);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let cache = PredicateCache::new();
        assert!(cache.get("k").is_none());
        cache.insert("k", Applicability::Applies);
        assert_eq!(cache.get("k"), Some(Applicability::Applies));
    }

    #[test]
    fn insert_overwrites() {
        let cache = PredicateCache::new();
        cache.insert("k", Applicability::Applies);
        cache.insert("k", Applicability::DoesNotApply);
        assert_eq!(cache.get("k"), Some(Applicability::DoesNotApply));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_empties() {
        let cache = PredicateCache::new();
        cache.insert("a", Applicability::Applies);
        cache.insert("b", Applicability::Score(0.5));
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let cache = PredicateCache::new();
        cache.insert("a", Applicability::Applies);
        assert!(cache.get("b").is_none());
    }
}
