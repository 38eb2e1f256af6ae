// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! Typed node identity and global deduplication of equal keys.
//!
//! A [`Keyed`] value pairs an evaluator's function-tag with its (opaque,
//! value-equal) argument. The [`Interner`] canonicalizes equal keys to the
//! same `Arc`, so that two callers who ask for the same key end up pointing
//! at the same allocation: hash lookups and dep-set membership tests on hot
//! paths can then compare by pointer instead of by value.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use fnv::{FnvBuildHasher, FnvHashMap};
use parking_lot::Mutex;

/// A key usable with an [`Interner`].
///
/// The two capability bits default to `false`; most evaluators need neither.
pub trait Keyed: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// If true, this key's declared dependencies are stored in a set-backed
    /// structure (rather than an append-only Vec) for faster membership
    /// tests, at the cost of losing intra-group ordering.
    fn skips_batch_prefetch(&self) -> bool {
        false
    }

    /// If true, the evaluator for this key may be re-entered while some of
    /// its previously declared dependencies are still in flight (see
    /// `graph::runtime`'s partial-reevaluation handling).
    fn supports_partial_reevaluation(&self) -> bool {
        false
    }
}

const DEFAULT_SHARDS: usize = 16;

/// A weak-value, sharded pool that canonicalizes equal keys to the same
/// `Arc<K>`.
///
/// Shards are locked independently so that interning unrelated keys never
/// contends on the same mutex. A key that is no longer referenced outside
/// the pool is free to be collected; [`Interner::shrink`] sweeps dead
/// entries, and is expected to be called between top-level evaluations.
pub struct Interner<K: Keyed> {
    shards: Vec<Mutex<FnvHashMap<K, Weak<K>>>>,
}

impl<K: Keyed> Interner<K> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(FnvHashMap::default()))
                .collect(),
        }
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = FnvBuildHasher::default().build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Returns the canonical `Arc<K>` for `key`, creating it if this is the
    /// first time `key` (by value equality) has been interned, or the prior
    /// interning has since been collected.
    pub fn intern(&self, key: K) -> Arc<K> {
        let mut shard = self.shards[self.shard_index(&key)].lock();
        if let Some(existing) = shard.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let arc = Arc::new(key.clone());
        shard.insert(key, Arc::downgrade(&arc));
        arc
    }

    /// Returns the canonical `Arc<K>` for `key` iff it is currently
    /// interned, without creating a new entry.
    pub fn get(&self, key: &K) -> Option<Arc<K>> {
        self.shards[self.shard_index(key)]
            .lock()
            .get(key)
            .and_then(Weak::upgrade)
    }

    /// Drops dead (no-longer-referenced) entries from every shard. Safe to
    /// call concurrently with `intern`/`get`.
    pub fn shrink(&self) {
        for shard in &self.shards {
            shard.lock().retain(|_, weak| weak.strong_count() > 0);
        }
    }

    /// Number of entries currently tracked, live or not. Call [`shrink`]
    /// first for an exact live count.
    ///
    /// [`shrink`]: Interner::shrink
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries whose weak reference is still upgradeable, without
    /// evicting the dead ones the way [`Interner::shrink`] does. For
    /// host-side memory instrumentation between evaluation runs.
    pub fn live_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().values().filter(|weak| weak.strong_count() > 0).count())
            .sum()
    }
}

impl<K: Keyed> Default for Interner<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Arg(u32);

    impl Keyed for Arg {}

    #[test]
    fn equal_keys_intern_to_the_same_pointer() {
        let interner: Interner<Arg> = Interner::new();
        let a = interner.intern(Arg(1));
        let b = interner.intern(Arg(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_keys_intern_to_distinct_pointers() {
        let interner: Interner<Arg> = Interner::new();
        let a = interner.intern(Arg(1));
        let b = interner.intern(Arg(2));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn shrink_collects_unreferenced_keys() {
        let interner: Interner<Arg> = Interner::new();
        {
            let _a = interner.intern(Arg(1));
            assert_eq!(interner.len(), 1);
        }
        interner.shrink();
        assert_eq!(interner.len(), 0);
    }

    #[test]
    fn get_without_create_returns_none_for_unseen_key() {
        let interner: Interner<Arg> = Interner::new();
        assert!(interner.get(&Arg(1)).is_none());
        let a = interner.intern(Arg(1));
        assert!(Arc::ptr_eq(&interner.get(&Arg(1)).unwrap(), &a));
    }

    #[test]
    fn default_capability_bits_are_false() {
        let a = Arg(1);
        assert!(!a.skips_batch_prefetch());
        assert!(!a.supports_partial_reevaluation());
    }

    #[test]
    fn live_count_ignores_dead_entries_without_evicting_them() {
        let interner: Interner<Arg> = Interner::new();
        let kept = interner.intern(Arg(1));
        {
            let _dropped = interner.intern(Arg(2));
        }
        assert_eq!(interner.live_count(), 1);
        assert_eq!(interner.len(), 2, "shrink not yet called, dead entry still tracked");
        drop(kept);
    }
}
