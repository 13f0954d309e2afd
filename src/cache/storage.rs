//! Local entry storage for one cache.
//!
//! Entries live in a single access-ordered map with a per-bucket key index on
//! the side, so a bucket can be shipped to another node or dropped without
//! scanning the whole store. The store is owned by the cache's store processor
//! and is never shared across tasks.

use crate::cache::entry::{CacheEntry, EntryView};
use crate::cache::extensions::{CacheInvalidator, InvalidatorElement};
use crate::clock::{Clock, Time};
use crate::config::{CacheConfig, EvictionConfig, EvictionPolicy};
use crate::error::{Result, StoreError};
use crate::partitioning::bucket_of;
use crate::rebalancing::TransferEntry;
use crate::types::BucketId;
use bytes::Bytes;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Result of a key lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Bytes),
    Miss,
    /// The entry had expired and was dropped.
    Expired,
    /// The entry had been invalidated and was dropped.
    Invalidated,
}

impl Lookup {
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }
}

/// Result of a write.
#[derive(Debug, Default)]
pub struct PutOutcome {
    /// Live value replaced by the write.
    pub previous: Option<Bytes>,
    /// Keys evicted to make room.
    pub evicted: Vec<Bytes>,
}

/// Bounded key/value store with lazy expiration.
pub struct EntryStore {
    entries: LruCache<Bytes, CacheEntry>,
    buckets: HashMap<BucketId, HashSet<Bytes>>,
    bucket_count: u32,
    eviction: EvictionConfig,
    default_ttl: Option<Duration>,
    bytes: u64,
    clock: Arc<Clock>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl EntryStore {
    pub fn new(
        config: &CacheConfig,
        clock: Arc<Clock>,
        invalidator: Option<Arc<dyn CacheInvalidator>>,
    ) -> Self {
        Self {
            entries: LruCache::unbounded(),
            buckets: HashMap::new(),
            bucket_count: config.bucket_count,
            eviction: config.eviction.clone(),
            default_ttl: config.default_ttl,
            bytes: 0,
            clock,
            invalidator,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by keys and values.
    pub fn byte_size(&self) -> u64 {
        self.bytes
    }

    pub fn bucket_of(&self, key: &[u8]) -> BucketId {
        bucket_of(key, self.bucket_count)
    }

    /// Buckets holding at least one entry.
    pub fn buckets(&self) -> Vec<BucketId> {
        let mut buckets: Vec<BucketId> = self.buckets.keys().copied().collect();
        buckets.sort_unstable();
        buckets
    }

    /// Look a key up, marking it as recently used under LRU.
    pub fn get(&mut self, key: &[u8]) -> Lookup {
        self.lookup(key, true)
    }

    /// Whether a live entry exists, without touching access order.
    pub fn contains(&mut self, key: &[u8]) -> bool {
        matches!(self.lookup(key, false), Lookup::Hit(_))
    }

    fn lookup(&mut self, key: &[u8], touch: bool) -> Lookup {
        let now = self.clock.current_time();
        let promote = touch && self.eviction.policy == EvictionPolicy::Lru;
        let entry = if promote {
            self.entries.get_mut(key)
        } else {
            self.entries.peek_mut(key)
        };
        let Some(entry) = entry else {
            return Lookup::Miss;
        };

        let outcome = if entry.is_expired(now) {
            Lookup::Expired
        } else {
            if !entry.invalid {
                if let Some(invalidator) = &self.invalidator {
                    let mut element = InvalidatorElement::new(key, entry);
                    invalidator.process(&mut element);
                    let invalid = element.is_invalid();
                    entry.invalid = invalid;
                }
            }
            if entry.invalid {
                Lookup::Invalidated
            } else {
                if touch {
                    entry.last_access = now;
                }
                Lookup::Hit(entry.value.clone())
            }
        };

        if !matches!(outcome, Lookup::Hit(_)) {
            self.remove_entry(key);
        }
        outcome
    }

    /// Write a value. `ttl` falls back to the cache's default TTL.
    pub fn put(&mut self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> Result<PutOutcome> {
        let now = self.clock.current_time();
        let entry = CacheEntry::new(value, now, ttl.or(self.default_ttl));
        self.check_size(&key, &entry)?;

        let previous = self.live_value(&key, now);
        let evicted = self.insert(key, entry);
        Ok(PutOutcome { previous, evicted })
    }

    /// Insert an entry received from another node, keeping its times.
    /// Already expired entries are skipped.
    pub fn insert_entry(&mut self, key: Bytes, entry: CacheEntry) -> Result<Vec<Bytes>> {
        if entry.is_expired(self.clock.current_time()) {
            return Ok(Vec::new());
        }
        self.check_size(&key, &entry)?;
        Ok(self.insert(key, entry))
    }

    /// Remove a key, returning its live value.
    pub fn remove(&mut self, key: &[u8]) -> Option<Bytes> {
        let now = self.clock.current_time();
        let entry = self.remove_entry(key)?;
        (!entry.invalid && !entry.is_expired(now)).then_some(entry.value)
    }

    /// Mark an entry invalid; it is dropped on next access.
    pub fn invalidate(&mut self, key: &[u8]) -> bool {
        match self.entries.peek_mut(key) {
            Some(entry) => {
                entry.invalid = true;
                true
            }
            None => false,
        }
    }

    /// Live entries of the given buckets.
    pub fn entries_in<'a>(
        &'a self,
        buckets: &'a [BucketId],
        now: Time,
    ) -> impl Iterator<Item = EntryView<'a>> + 'a {
        buckets
            .iter()
            .filter_map(|bucket| self.buckets.get(bucket))
            .flat_map(|keys| keys.iter())
            .filter_map(move |key| {
                let entry = self.entries.peek(key)?;
                if entry.invalid || entry.is_expired(now) {
                    return None;
                }
                Some(EntryView {
                    key,
                    value: &entry.value,
                    created: entry.created,
                    expiration: entry.expiration,
                })
            })
    }

    /// Snapshot of a bucket's live entries for handoff or replica sync.
    pub fn bucket_entries(&self, bucket: BucketId) -> Vec<TransferEntry> {
        let now = self.clock.current_time();
        let buckets = [bucket];
        self.entries_in(&buckets, now)
            .map(|view| TransferEntry {
                key: view.key.clone(),
                value: view.value.clone(),
                created: view.created,
                expiration: view.expiration,
            })
            .collect()
    }

    /// A live entry with its times, without touching access order.
    pub fn snapshot(&self, key: &[u8]) -> Option<TransferEntry> {
        let now = self.clock.current_time();
        let entry = self.entries.peek(key)?;
        (!entry.invalid && !entry.is_expired(now))
            .then(|| TransferEntry::from_entry(Bytes::copy_from_slice(key), entry))
    }

    /// Number of entries indexed under a bucket, live or not.
    pub fn bucket_len(&self, bucket: BucketId) -> usize {
        self.buckets.get(&bucket).map_or(0, HashSet::len)
    }

    /// Drop every entry of a bucket, returning how many were dropped.
    pub fn remove_bucket(&mut self, bucket: BucketId) -> usize {
        let Some(keys) = self.buckets.remove(&bucket) else {
            return 0;
        };
        for key in &keys {
            if let Some(entry) = self.entries.pop(key) {
                self.bytes -= entry.weight(key);
            }
        }
        keys.len()
    }

    /// Drop entries expired at `now`.
    pub fn remove_expired(&mut self, now: Time) -> usize {
        let expired: Vec<Bytes> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.buckets.clear();
        self.bytes = 0;
    }

    fn check_size(&self, key: &[u8], entry: &CacheEntry) -> Result<()> {
        if let Some(max) = self.eviction.max_bytes {
            let size = entry.weight(key);
            if size > max {
                return Err(StoreError::EntryTooLarge { size, max }.into());
            }
        }
        Ok(())
    }

    fn live_value(&self, key: &[u8], now: Time) -> Option<Bytes> {
        self.entries
            .peek(key)
            .filter(|entry| !entry.invalid && !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    fn insert(&mut self, key: Bytes, entry: CacheEntry) -> Vec<Bytes> {
        self.bytes += entry.weight(&key);
        let bucket = self.bucket_of(&key);

        // FIFO keeps the original insertion position on overwrite.
        let fifo = self.eviction.policy == EvictionPolicy::Fifo;
        let replaced = match self.entries.peek_mut(&key) {
            Some(slot) if fifo => {
                Some(std::mem::replace(slot, entry))
            }
            _ => self.entries.put(key.clone(), entry),
        };
        if let Some(old) = replaced {
            self.bytes -= old.weight(&key);
        }
        self.buckets.entry(bucket).or_default().insert(key);
        self.evict()
    }

    fn evict(&mut self) -> Vec<Bytes> {
        let mut evicted = Vec::new();
        while self.over_capacity() {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes -= entry.weight(&key);
            self.unindex(&key);
            evicted.push(key);
        }
        evicted
    }

    fn over_capacity(&self) -> bool {
        let elements = self
            .eviction
            .max_elements
            .is_some_and(|max| self.entries.len() > max);
        let bytes = self.eviction.max_bytes.is_some_and(|max| self.bytes > max);
        elements || bytes
    }

    fn remove_entry(&mut self, key: &[u8]) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes -= entry.weight(key);
        self.unindex(key);
        Some(entry)
    }

    fn unindex(&mut self, key: &[u8]) {
        let bucket = self.bucket_of(key);
        if let Some(keys) = self.buckets.get_mut(&bucket) {
            keys.remove(key);
            if keys.is_empty() {
                self.buckets.remove(&bucket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualWallClock;

    fn store(config: CacheConfig) -> (EntryStore, Arc<ManualWallClock>) {
        let (clock, wall) = Clock::manual(10_000);
        (EntryStore::new(&config, Arc::new(clock), None), wall)
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_put_get_remove() {
        let (mut store, _) = store(CacheConfig::new("test"));

        let outcome = store.put(b("k"), b("v1"), None).unwrap();
        assert!(outcome.previous.is_none());
        assert_eq!(store.get(b"k"), Lookup::Hit(b("v1")));

        let outcome = store.put(b("k"), b("v2"), None).unwrap();
        assert_eq!(outcome.previous, Some(b("v1")));
        assert_eq!(store.len(), 1);
        assert_eq!(store.byte_size(), 3);

        assert_eq!(store.remove(b"k"), Some(b("v2")));
        assert_eq!(store.get(b"k"), Lookup::Miss);
        assert!(store.is_empty());
        assert_eq!(store.byte_size(), 0);
        assert!(store.buckets().is_empty());
    }

    #[test]
    fn test_ttl_expiry() {
        let (mut store, wall) = store(CacheConfig::new("orders").with_bucket_count(17));
        store.put(b("o1"), b("42"), Some(Duration::from_millis(5000))).unwrap();

        wall.advance(Duration::from_millis(4999));
        assert_eq!(store.get(b"o1"), Lookup::Hit(b("42")));

        wall.advance(Duration::from_millis(1));
        assert_eq!(store.get(b"o1"), Lookup::Expired);
        assert_eq!(store.get(b"o1"), Lookup::Miss);
        assert!(store.is_empty());
    }

    #[test]
    fn test_default_ttl_and_override() {
        let config = CacheConfig::new("c").with_default_ttl(Duration::from_secs(1));
        let (mut store, wall) = store(config);
        store.put(b("default"), b("v"), None).unwrap();
        store.put(b("long"), b("v"), Some(Duration::from_secs(10))).unwrap();

        wall.advance(Duration::from_secs(2));
        assert!(!store.contains(b"default"));
        assert!(store.contains(b"long"));
    }

    #[test]
    fn test_lru_eviction() {
        let config = CacheConfig::new("c").with_eviction(EvictionConfig::lru(3));
        let (mut store, _) = store(config);
        for key in ["a", "b", "c"] {
            store.put(b(key), b("v"), None).unwrap();
        }
        // Touch "a" so "b" becomes least recently used.
        assert!(matches!(store.get(b"a"), Lookup::Hit(_)));

        let outcome = store.put(b("d"), b("v"), None).unwrap();
        assert_eq!(outcome.evicted, vec![b("b")]);
        assert_eq!(store.len(), 3);
        assert!(store.contains(b"a"));
        assert!(!store.contains(b"b"));
    }

    #[test]
    fn test_fifo_eviction_ignores_access() {
        let config = CacheConfig::new("c").with_eviction(EvictionConfig::fifo(2));
        let (mut store, _) = store(config);
        store.put(b("a"), b("v"), None).unwrap();
        store.put(b("b"), b("v"), None).unwrap();
        assert!(matches!(store.get(b"a"), Lookup::Hit(_)));

        let outcome = store.put(b("c"), b("v"), None).unwrap();
        assert_eq!(outcome.evicted, vec![b("a")]);
    }

    #[test]
    fn test_byte_bound() {
        let config =
            CacheConfig::new("c").with_eviction(EvictionConfig::default().with_max_bytes(10));
        let (mut store, _) = store(config);
        store.put(b("k1"), b("vvv"), None).unwrap();
        store.put(b("k2"), b("vvv"), None).unwrap();
        assert_eq!(store.byte_size(), 10);

        let outcome = store.put(b("k3"), b("v"), None).unwrap();
        assert_eq!(outcome.evicted, vec![b("k1")]);
        assert!(store.byte_size() <= 10);

        let err = store.put(b("big"), Bytes::from(vec![0u8; 20]), None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Store(StoreError::EntryTooLarge { size: 23, max: 10 })
        ));
    }

    #[test]
    fn test_invalidate_drops_on_next_access() {
        let (mut store, _) = store(CacheConfig::new("c"));
        store.put(b("k"), b("v"), None).unwrap();
        assert!(store.invalidate(b"k"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"k"), Lookup::Invalidated);
        assert_eq!(store.len(), 0);
        assert!(!store.invalidate(b"missing"));
    }

    #[test]
    fn test_bucket_index() {
        let config = CacheConfig::new("c").with_bucket_count(4);
        let (mut store, _) = store(config);
        for i in 0..40 {
            store.put(b(&format!("key-{i}")), b("v"), None).unwrap();
        }
        let total: usize = store.buckets().iter().map(|&bk| store.bucket_len(bk)).sum();
        assert_eq!(total, 40);

        let bucket = store.bucket_of(b"key-7");
        let entries = store.bucket_entries(bucket);
        assert!(entries.iter().any(|e| e.key == b("key-7")));
        assert!(entries.iter().all(|e| store.bucket_of(&e.key) == bucket));

        let dropped = store.remove_bucket(bucket);
        assert_eq!(dropped, entries.len());
        assert_eq!(store.len(), 40 - dropped);
        assert!(!store.contains(b"key-7"));
    }

    #[test]
    fn test_insert_entry_keeps_expiration() {
        let (mut store, wall) = store(CacheConfig::new("c"));
        let entry = CacheEntry::restored(b("v"), Time::new(9_000, 0), Some(Time::new(12_000, 0)));
        store.insert_entry(b("k"), entry).unwrap();
        assert!(store.contains(b"k"));

        wall.set(12_000);
        assert!(!store.contains(b"k"));

        let stale = CacheEntry::restored(b("v"), Time::new(1, 0), Some(Time::new(2, 0)));
        store.insert_entry(b("old"), stale).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_expired_sweep() {
        let (mut store, wall) = store(CacheConfig::new("c"));
        store.put(b("short"), b("v"), Some(Duration::from_millis(10))).unwrap();
        store.put(b("forever"), b("v"), None).unwrap();

        wall.advance(Duration::from_millis(20));
        let now = Time::new(10_020, 0);
        assert_eq!(store.remove_expired(now), 1);
        assert_eq!(store.len(), 1);
    }

    struct PrefixInvalidator;

    impl CacheInvalidator for PrefixInvalidator {
        fn process(&self, element: &mut InvalidatorElement<'_>) {
            if element.key().starts_with(b"stale:") {
                element.invalidate();
            }
        }
    }

    #[test]
    fn test_invalidator_runs_on_access() {
        let (clock, _) = Clock::manual(0);
        let mut store = EntryStore::new(
            &CacheConfig::new("c"),
            Arc::new(clock),
            Some(Arc::new(PrefixInvalidator)),
        );
        store.put(b("stale:1"), b("v"), None).unwrap();
        store.put(b("fresh:1"), b("v"), None).unwrap();

        assert_eq!(store.get(b"stale:1"), Lookup::Invalidated);
        assert_eq!(store.get(b"fresh:1"), Lookup::Hit(b("v")));
    }
}
