// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use fnv::FnvHashMap;
use key::Interner;
use parking_lot::RwLock;

use crate::entry::Entry;
use crate::node::Node;

pub(crate) const DEFAULT_SHARDS: usize = 16;

/// The thread-safe table mapping key to node entry. Sharded the same
/// way `key::Interner` is, so that unrelated keys rarely contend.
pub(crate) struct NodeStore<N: Node> {
    interner: Interner<N>,
    shards: Vec<RwLock<FnvHashMap<Arc<N>, Arc<Entry<N>>>>>,
}

fn shard_index<N: Node>(key: &N, shard_count: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = fnv::FnvHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

impl<N: Node> NodeStore<N> {
    pub(crate) fn new(shard_count: usize) -> NodeStore<N> {
        let shard_count = shard_count.max(1);
        NodeStore {
            interner: Interner::with_shards(shard_count),
            shards: (0..shard_count)
                .map(|_| RwLock::new(FnvHashMap::default()))
                .collect(),
        }
    }

    /// Interns `key`, then atomically gets or creates its entry.
    pub(crate) fn create_if_absent(&self, key: N) -> (Arc<N>, Arc<Entry<N>>) {
        let key = self.interner.intern(key);
        let idx = shard_index(&key, self.shards.len());
        {
            let shard = self.shards[idx].read();
            if let Some(entry) = shard.get(&key) {
                return (key, Arc::clone(entry));
            }
        }
        let mut shard = self.shards[idx].write();
        let entry = shard
            .entry(Arc::clone(&key))
            .or_insert_with(|| Arc::new(Entry::new(Arc::clone(&key))))
            .clone();
        (key, entry)
    }

    pub(crate) fn get(&self, key: &N) -> Option<Arc<Entry<N>>> {
        let interned = self.interner.get(key)?;
        let idx = shard_index(&interned, self.shards.len());
        self.shards[idx].read().get(&interned).cloned()
    }

    /// All live entries, for `mark_affected`/`delete_if`/diagnostics.
    pub(crate) fn iter_entries(&self) -> Vec<Arc<Entry<N>>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Removes entries matching `predicate`, running `Node::clean_up_state`
    /// on each before it is dropped.
    pub(crate) fn delete_if(&self, predicate: impl Fn(&N) -> bool) {
        for shard in &self.shards {
            let mut shard = shard.write();
            let doomed: Vec<Arc<N>> = shard
                .keys()
                .filter(|key| predicate(key))
                .cloned()
                .collect();
            for key in doomed {
                if let Some(entry) = shard.remove(&key) {
                    entry.key().clean_up_state();
                }
            }
        }
        self.interner.shrink();
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub(crate) fn shrink_interner(&self) {
        self.interner.shrink();
    }
}
