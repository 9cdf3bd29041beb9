//! Caches of compiled primitives keyed by [`OpSignature`].

use crate::signature::OpSignature;
use anyhow::Result;
use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Debug},
    sync::Arc,
};

/// Decides which entries to evict.
pub trait EvictionPolicy: Debug + Send {
    /// Called after `key` is inserted, returns keys to evict.
    fn on_insert(&mut self, key: &OpSignature) -> Vec<OpSignature>;
    /// Called when the cache is cleared.
    fn clear(&mut self) {}
}

/// Never evicts.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unbounded;

impl EvictionPolicy for Unbounded {
    fn on_insert(&mut self, _key: &OpSignature) -> Vec<OpSignature> {
        Vec::new()
    }
}

/// Evicts the oldest inserted entries beyond `capacity`.
#[derive(Clone, Debug)]
pub struct InsertionOrder {
    capacity: usize,
    order: VecDeque<OpSignature>,
}

impl InsertionOrder {
    /// Creates a policy holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
        }
    }
}

impl EvictionPolicy for InsertionOrder {
    fn on_insert(&mut self, key: &OpSignature) -> Vec<OpSignature> {
        self.order.push_back(key.clone());
        let excess = self.order.len().saturating_sub(self.capacity);
        self.order.drain(..excess).collect()
    }
    fn clear(&mut self) {
        self.order.clear();
    }
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Lookups that found an entry.
    pub hits: usize,
    /// Lookups that built an entry.
    pub misses: usize,
    /// Entries removed by the policy.
    pub evictions: usize,
}

/// Maps signatures to shared compiled primitives.
pub struct PrimitiveCache<P> {
    entries: HashMap<OpSignature, Arc<P>>,
    policy: Box<dyn EvictionPolicy>,
    stats: CacheStats,
}

impl<P> Default for PrimitiveCache<P> {
    fn default() -> Self {
        Self::new(Box::new(Unbounded))
    }
}

impl<P> Debug for PrimitiveCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PrimitiveCache")
            .field("len", &self.entries.len())
            .field("policy", &self.policy)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<P> PrimitiveCache<P> {
    /// Creates an empty cache with `policy`.
    pub fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            stats: CacheStats::default(),
        }
    }
    /// Creates an empty cache, bounded when `capacity` is provided.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        if let Some(capacity) = capacity {
            Self::new(Box::new(InsertionOrder::new(capacity)))
        } else {
            Self::default()
        }
    }
    /// Returns the entry for `key`, building it on a miss.
    ///
    /// The builder is called at most once, and its result is only stored on success.
    ///
    /// **Errors**
    /// - The builder failed.
    pub fn get_or_build(
        &mut self,
        key: OpSignature,
        build: impl FnOnce() -> Result<P>,
    ) -> Result<Arc<P>> {
        use std::collections::hash_map::Entry;
        let primitive = match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                self.stats.hits += 1;
                tracing::trace!(hash = occupied.key().hash_value(), "primitive cache hit");
                return Ok(occupied.get().clone());
            }
            Entry::Vacant(vacant) => {
                tracing::debug!(hash = vacant.key().hash_value(), "primitive cache miss");
                let primitive = Arc::new(build()?);
                self.stats.misses += 1;
                let key = vacant.key().clone();
                vacant.insert(primitive.clone());
                for evicted in self.policy.on_insert(&key) {
                    if self.entries.remove(&evicted).is_some() {
                        self.stats.evictions += 1;
                    }
                }
                primitive
            }
        };
        Ok(primitive)
    }
    /// Whether there is an entry for `key`.
    pub fn contains(&self, key: &OpSignature) -> bool {
        self.entries.contains_key(key)
    }
    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    /// The counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
    /// Removes all entries, keeping the counters.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.policy.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn key(x: usize) -> OpSignature {
        let mut sig = OpSignature::new();
        sig.add(&x);
        sig
    }

    #[test]
    fn get_or_build_once() {
        let mut cache = PrimitiveCache::<usize>::default();
        let mut builds = 0;
        let a = cache
            .get_or_build(key(1), || {
                builds += 1;
                Ok(10)
            })
            .unwrap();
        let b = cache
            .get_or_build(key(1), || {
                builds += 1;
                Ok(20)
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 10);
        assert_eq!(builds, 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn failed_build_not_stored() {
        let mut cache = PrimitiveCache::<usize>::default();
        assert!(cache.get_or_build(key(1), || bail!("no")).is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_build(key(1), || Ok(3)).unwrap(), 3);
    }

    #[test]
    fn insertion_order_evicts_oldest() {
        let mut cache = PrimitiveCache::<usize>::with_capacity(Some(2));
        for x in 0..3 {
            cache.get_or_build(key(x), || Ok(x)).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key(0)));
        assert!(cache.contains(&key(2)));
        assert_eq!(cache.stats().evictions, 1);
    }
}
