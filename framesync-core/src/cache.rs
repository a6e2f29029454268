//! Frame/Audio Cache
//!
//! Bounded, position-keyed store of converted output. Entries are immutable
//! `Arc` snapshots published under a write lock, so a reader never sees a
//! half-built entry. Reads only take the read lock and bump a recency tick;
//! the least recently used entry is evicted when full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Key every position maps to for still-image sources
pub const STILL_IMAGE_KEY: i64 = 0;

pub fn cache_key(position: i64, still_image: bool) -> i64 {
    if still_image {
        STILL_IMAGE_KEY
    } else {
        position
    }
}

struct CacheEntry<T> {
    value: Arc<T>,
    last_used: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

pub struct FrameCache<T> {
    capacity: usize,
    entries: RwLock<HashMap<i64, CacheEntry<T>>>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<T> FrameCache<T> {
    /// A capacity of 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, position: i64) -> Option<Arc<T>> {
        if !self.is_enabled() {
            return None;
        }
        let entries = self.entries.read();
        match entries.get(&position) {
            Some(entry) => {
                entry.last_used.store(self.next_tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Publish a snapshot, evicting the least recently used entry if full
    pub fn put(&self, position: i64, value: Arc<T>) {
        if !self.is_enabled() {
            return;
        }
        let tick = self.next_tick();
        let mut entries = self.entries.write();
        if !entries.contains_key(&position) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Cache evicted position {}", oldest);
            }
        }
        entries.insert(
            position,
            CacheEntry {
                value,
                last_used: AtomicU64::new(tick),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction() {
        let cache = FrameCache::new(2);
        cache.put(1, Arc::new("one"));
        cache.put(2, Arc::new("two"));
        // Touch 1 so 2 becomes the oldest
        assert!(cache.get(1).is_some());
        cache.put(3, Arc::new("three"));

        assert!(cache.get(2).is_none());
        assert_eq!(*cache.get(1).unwrap(), "one");
        assert_eq!(*cache.get(3).unwrap(), "three");
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_same_position_does_not_evict() {
        let cache = FrameCache::new(2);
        cache.put(1, Arc::new(10));
        cache.put(2, Arc::new(20));
        cache.put(2, Arc::new(21));
        assert_eq!(cache.len(), 2);
        assert_eq!(*cache.get(2).unwrap(), 21);
    }

    #[test]
    fn test_disabled() {
        let cache = FrameCache::new(0);
        cache.put(1, Arc::new(1));
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_shared() {
        let cache = FrameCache::new(4);
        let value = Arc::new(vec![1u8, 2, 3]);
        cache.put(7, value.clone());
        assert!(Arc::ptr_eq(&cache.get(7).unwrap(), &value));
    }

    #[test]
    fn test_still_image_key() {
        assert_eq!(cache_key(123, true), STILL_IMAGE_KEY);
        assert_eq!(cache_key(123, false), 123);
    }
}
