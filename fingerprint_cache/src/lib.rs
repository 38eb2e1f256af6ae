// Copyright 2026 The Ridge Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

//! An in-memory, bidirectional cache between serialized-content fingerprints
//! and live values, with in-flight-operation deduplication.
//!
//! Values whose construction is expensive (deserialized artifact graphs,
//! configuration snapshots) may be requested by fingerprint from many
//! concurrent evaluators. This cache deduplicates both the write path
//! (serialize + store) and the read path (fetch + deserialize): the first
//! caller to ask for a given value/fingerprint becomes the owner of the
//! underlying work, and everyone else is handed the same in-flight future to
//! await instead of redoing it.

mod fingerprint;

pub use fingerprint::{Fingerprint, InvalidFingerprint};

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use fnv::FnvHashMap;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

const DEFAULT_SHARDS: usize = 16;

/// Extra context needed to disambiguate values that share a serialized
/// representation.
///
/// If parent `P` and child `C` share a common subvalue `S`, serializing `C`
/// may omit `S` because `P` already provides it. A later deserialization of
/// `C` alone cannot tell such a `C` apart from a `C'` whose context differs:
/// the distinguisher carries the missing context and becomes part of the
/// cache key.
pub trait Distinguisher: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> Distinguisher for T {}

/// An opaque cause of a put or get failing. Cloneable so that every waiter
/// on a failed in-flight operation observes the same error.
pub type CacheError = Arc<dyn std::error::Error + Send + Sync>;

pub type PutFuture = Shared<BoxFuture<'static, Result<Fingerprint, CacheError>>>;
pub type GetFuture<V> = Shared<BoxFuture<'static, Result<Arc<V>, CacheError>>>;

/// The result of [`FingerprintValueCache::get_or_claim_put`] when a put for
/// this value is already known or already in flight.
#[derive(Clone)]
pub enum PutClaim {
    /// The fingerprint was already computed and stored.
    Done(Fingerprint),
    /// Another caller's put is in flight; await this future for the result.
    InFlight(PutFuture),
}

/// The result of [`FingerprintValueCache::get_or_claim_get`] when a get for
/// this fingerprint is already known or already in flight.
#[derive(Clone)]
pub enum GetClaim<V> {
    Done(Arc<V>),
    InFlight(GetFuture<V>),
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ReadKey<D> {
    fingerprint: Fingerprint,
    distinguisher: Option<D>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct WriteKey<D> {
    // Identity of the value, by allocation address of the Arc it lives behind.
    addr: usize,
    distinguisher: Option<D>,
}

enum ReadSlot<V> {
    InFlight(GetFuture<V>),
    // A weak reference: once every other owner of the value drops it, the
    // deserialization cache should not be the thing keeping it alive.
    Done(std::sync::Weak<V>),
}

enum WriteSlot<V, D> {
    InFlight(PutFuture),
    Done {
        weak: std::sync::Weak<V>,
        fingerprint: Fingerprint,
        _distinguisher: Option<D>,
    },
}

/// The two-directional cache described above.
///
/// `V` is the value type; `D` is the distinguisher type (`()` if values are
/// never ambiguous from their fingerprint alone).
pub struct FingerprintValueCache<V: Send + Sync + 'static, D: Distinguisher = ()> {
    read_shards: Vec<Mutex<FnvHashMap<ReadKey<D>, ReadSlot<V>>>>,
    write_shards: Vec<Mutex<FnvHashMap<WriteKey<D>, WriteSlot<V, D>>>>,
}

fn shard_of<T: Hash>(key: &T, shard_count: usize) -> usize {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

impl<V: Send + Sync + 'static, D: Distinguisher> FingerprintValueCache<V, D> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            read_shards: (0..shard_count)
                .map(|_| Mutex::new(FnvHashMap::default()))
                .collect(),
            write_shards: (0..shard_count)
                .map(|_| Mutex::new(FnvHashMap::default()))
                .collect(),
        }
    }

    fn value_addr(value: &Arc<V>) -> usize {
        Arc::as_ptr(value) as usize
    }

    /// Claims ownership of serializing `value` (identified, if necessary, by
    /// `distinguisher`), or returns the existing in-flight/complete put.
    ///
    /// `None` means the caller now owns the put: they should perform it and
    /// report the outcome through [`FingerprintValueCache::complete_put`].
    /// The `future` passed in is stored so that concurrent callers can await
    /// the same work; the owner is expected to await `future.clone()`
    /// themselves to drive it forward.
    pub fn get_or_claim_put(
        &self,
        value: &Arc<V>,
        distinguisher: Option<D>,
        future: PutFuture,
    ) -> Option<PutClaim> {
        let key = WriteKey {
            addr: Self::value_addr(value),
            distinguisher,
        };
        let shard_idx = shard_of(&key, self.write_shards.len());
        let mut shard = self.write_shards[shard_idx].lock();
        match shard.get(&key) {
            Some(WriteSlot::InFlight(existing)) => Some(PutClaim::InFlight(existing.clone())),
            Some(WriteSlot::Done {
                weak,
                fingerprint, ..
            }) if weak.upgrade().is_some() => Some(PutClaim::Done(*fingerprint)),
            _ => {
                shard.insert(key, WriteSlot::InFlight(future));
                None
            }
        }
    }

    /// Reports the outcome of a put this caller was handed ownership of via
    /// `get_or_claim_put` returning `None`. On success, also populates the
    /// reverse (fingerprint -> value) map so that subsequent deserializations
    /// of this fingerprint are served locally.
    pub fn complete_put(
        &self,
        value: &Arc<V>,
        distinguisher: Option<D>,
        result: &Result<Fingerprint, CacheError>,
    ) {
        let key = WriteKey {
            addr: Self::value_addr(value),
            distinguisher: distinguisher.clone(),
        };
        let shard_idx = shard_of(&key, self.write_shards.len());
        {
            let mut shard = self.write_shards[shard_idx].lock();
            match result {
                Ok(fingerprint) => {
                    shard.insert(
                        key,
                        WriteSlot::Done {
                            weak: Arc::downgrade(value),
                            fingerprint: *fingerprint,
                            _distinguisher: distinguisher.clone(),
                        },
                    );
                }
                Err(_) => {
                    shard.remove(&key);
                }
            }
        }
        if let Ok(fingerprint) = result {
            self.populate_read_cache(*fingerprint, distinguisher, Arc::clone(value));
        }
    }

    /// Claims ownership of deserializing `fingerprint`, or returns the
    /// existing in-flight/complete get.
    pub fn get_or_claim_get(
        &self,
        fingerprint: Fingerprint,
        distinguisher: Option<D>,
        future: GetFuture<V>,
    ) -> Option<GetClaim<V>> {
        let key = ReadKey {
            fingerprint,
            distinguisher,
        };
        let shard_idx = shard_of(&key, self.read_shards.len());
        let mut shard = self.read_shards[shard_idx].lock();
        match shard.get(&key) {
            Some(ReadSlot::InFlight(existing)) => Some(GetClaim::InFlight(existing.clone())),
            Some(ReadSlot::Done(weak)) => weak.upgrade().map(GetClaim::Done),
            None => {
                shard.insert(key, ReadSlot::InFlight(future));
                None
            }
        }
    }

    /// Reports the outcome of a get this caller owns. On success, replaces
    /// the in-flight future with a weak reference to the deserialized value.
    pub fn complete_get(
        &self,
        fingerprint: Fingerprint,
        distinguisher: Option<D>,
        result: &Result<Arc<V>, CacheError>,
    ) {
        self.populate_read_cache_from_result(fingerprint, distinguisher, result);
    }

    fn populate_read_cache(&self, fingerprint: Fingerprint, distinguisher: Option<D>, value: Arc<V>) {
        self.populate_read_cache_from_result(fingerprint, distinguisher, &Ok(value));
    }

    fn populate_read_cache_from_result(
        &self,
        fingerprint: Fingerprint,
        distinguisher: Option<D>,
        result: &Result<Arc<V>, CacheError>,
    ) {
        let key = ReadKey {
            fingerprint,
            distinguisher,
        };
        let shard_idx = shard_of(&key, self.read_shards.len());
        let mut shard = self.read_shards[shard_idx].lock();
        match result {
            Ok(value) => {
                shard.insert(key, ReadSlot::Done(Arc::downgrade(value)));
            }
            Err(_) => {
                shard.remove(&key);
            }
        }
    }

    /// Drops dead weak entries from both maps. Intended for idle-period
    /// maintenance between evaluation runs.
    pub fn shrink(&self) {
        for shard in &self.read_shards {
            shard
                .lock()
                .retain(|_, slot| !matches!(slot, ReadSlot::Done(weak) if weak.strong_count() == 0));
        }
        for shard in &self.write_shards {
            shard.lock().retain(|_, slot| {
                !matches!(slot, WriteSlot::Done { weak, .. } if weak.strong_count() == 0)
            });
        }
    }
}

impl<V: Send + Sync + 'static, D: Distinguisher> Default for FingerprintValueCache<V, D> {
    fn default() -> Self {
        Self::new()
    }
}
