//! In-memory storage module with expiration and memory limits.
//!
//! Provides a thread-safe key-value store with:
//! - Memcached-style expiration (relative seconds or absolute unix time)
//! - Memory usage tracking and capping
//! - LRU eviction when memory limit is reached

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Exptime values above this many seconds are absolute unix timestamps.
const RELATIVE_EXPTIME_LIMIT: i64 = 60 * 60 * 24 * 30;

/// A single cached item
#[derive(Debug, Clone)]
pub struct CacheItem {
    /// The stored value
    pub value: Vec<u8>,
    /// Opaque 32-bit value stored with the item
    pub flags: u32,
    /// Absolute expiration time (None = never expires)
    pub expires_at: Option<Instant>,
    /// Access sequence number used for LRU ordering
    last_access: u64,
}

impl CacheItem {
    /// Approximate memory footprint of this item under `key`
    fn footprint(key: &str, value_len: usize) -> usize {
        std::mem::size_of::<Self>() + key.len() + value_len
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Result of a storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageResult {
    /// Operation succeeded
    Stored,
    /// Item was not stored (add on existing key, replace on missing key, too large)
    NotStored,
    /// Item not found
    NotFound,
    /// Successfully deleted
    Deleted,
}

/// Incr/decr applied to a value that is not a decimal u64.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot increment or decrement non-numeric value")]
pub struct NonNumericValue;

#[derive(Default)]
struct Inner {
    items: HashMap<String, CacheItem>,
    memory_used: usize,
    access_counter: u64,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    fn remove(&mut self, key: &str) -> Option<CacheItem> {
        let item = self.items.remove(key)?;
        self.memory_used -= CacheItem::footprint(key, item.value.len());
        Some(item)
    }

    /// Returns the live item under `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut CacheItem> {
        if self.items.get(key).is_some_and(|item| item.is_expired(now)) {
            trace!(key, "Item expired on access");
            self.remove(key);
            return None;
        }
        self.items.get_mut(key)
    }

    fn insert(&mut self, key: &str, item: CacheItem) {
        self.remove(key);
        self.memory_used += CacheItem::footprint(key, item.value.len());
        self.items.insert(key.to_string(), item);
    }

    /// Evict until `needed` more bytes fit under `max_memory`.
    fn make_room(&mut self, needed: usize, max_memory: usize, now: Instant) {
        if self.memory_used + needed <= max_memory {
            return;
        }

        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }

        while self.memory_used + needed > max_memory {
            let Some(victim) = self
                .items
                .iter()
                .min_by_key(|(_, item)| item.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            debug!(key = %victim, "Evicting LRU item");
            self.remove(&victim);
        }
    }
}

/// Thread-safe in-memory cache storage
pub struct Storage {
    inner: RwLock<Inner>,
    /// Maximum memory allowed
    max_memory: usize,
}

impl Storage {
    /// Create a new storage instance
    pub fn new(max_memory: usize) -> Arc<Self> {
        info!(max_memory_mb = max_memory / 1024 / 1024, "Initializing storage");
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            max_memory,
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translate a memcached exptime into an absolute deadline.
    ///
    /// `0` never expires, values up to 30 days are relative seconds, larger
    /// values are unix timestamps, negative values are already expired.
    fn expiry(exptime: i64, now: Instant) -> Option<Instant> {
        match exptime {
            0 => None,
            t if t < 0 => Some(now),
            t if t <= RELATIVE_EXPTIME_LIMIT => Some(now + Duration::from_secs(t as u64)),
            t => {
                let remaining = t - Utc::now().timestamp();
                Some(now + Duration::from_secs(remaining.max(0) as u64))
            }
        }
    }

    /// Get an item from storage
    pub fn get(&self, key: &str) -> Option<CacheItem> {
        let now = Instant::now();
        let mut inner = self.write();
        let seq = inner.touch();
        let item = inner.live(key, now)?;
        item.last_access = seq;
        Some(item.clone())
    }

    /// Get multiple items, skipping keys that are missing or expired
    pub fn get_multi(&self, keys: &[&str]) -> Vec<(String, CacheItem)> {
        keys.iter()
            .filter_map(|&key| self.get(key).map(|item| (key.to_string(), item)))
            .collect()
    }

    /// Store a value unconditionally
    pub fn set(&self, key: &str, value: Vec<u8>, flags: u32, exptime: i64) -> StorageResult {
        self.store(key, value, flags, exptime, |_| true)
    }

    /// Store a value only if the key is absent
    pub fn add(&self, key: &str, value: Vec<u8>, flags: u32, exptime: i64) -> StorageResult {
        self.store(key, value, flags, exptime, |existing| !existing)
    }

    /// Store a value only if the key is present
    pub fn replace(&self, key: &str, value: Vec<u8>, flags: u32, exptime: i64) -> StorageResult {
        self.store(key, value, flags, exptime, |existing| existing)
    }

    fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        flags: u32,
        exptime: i64,
        admit: impl FnOnce(bool) -> bool,
    ) -> StorageResult {
        let now = Instant::now();
        let mut inner = self.write();
        let existing = inner.live(key, now).is_some();
        if !admit(existing) {
            return StorageResult::NotStored;
        }

        let size = CacheItem::footprint(key, value.len());
        if size > self.max_memory {
            return StorageResult::NotStored;
        }

        inner.remove(key);
        inner.make_room(size, self.max_memory, now);
        let last_access = inner.touch();
        inner.insert(
            key,
            CacheItem {
                value,
                flags,
                expires_at: Self::expiry(exptime, now),
                last_access,
            },
        );
        trace!(key, size, "Stored item");
        StorageResult::Stored
    }

    /// Append data to an existing value
    pub fn append(&self, key: &str, data: &[u8]) -> StorageResult {
        self.concat(key, |value| value.extend_from_slice(data))
    }

    /// Prepend data to an existing value
    pub fn prepend(&self, key: &str, data: &[u8]) -> StorageResult {
        self.concat(key, |value| {
            value.splice(0..0, data.iter().copied());
        })
    }

    fn concat(&self, key: &str, edit: impl FnOnce(&mut Vec<u8>)) -> StorageResult {
        let now = Instant::now();
        let mut inner = self.write();
        let Some(item) = inner.live(key, now) else {
            return StorageResult::NotStored;
        };

        let mut item = item.clone();
        edit(&mut item.value);
        let size = CacheItem::footprint(key, item.value.len());
        if size > self.max_memory {
            return StorageResult::NotStored;
        }

        inner.remove(key);
        inner.make_room(size, self.max_memory, now);
        item.last_access = inner.touch();
        inner.insert(key, item);
        StorageResult::Stored
    }

    /// Delete an item
    pub fn delete(&self, key: &str) -> StorageResult {
        let now = Instant::now();
        let mut inner = self.write();
        if inner.live(key, now).is_none() {
            return StorageResult::NotFound;
        }
        inner.remove(key);
        StorageResult::Deleted
    }

    /// Add `delta` to a decimal value (wrapping) or subtract it (saturating at 0).
    ///
    /// Returns `Ok(None)` when the key does not exist.
    pub fn incr_decr(
        &self,
        key: &str,
        delta: u64,
        increment: bool,
    ) -> Result<Option<u64>, NonNumericValue> {
        let now = Instant::now();
        let mut inner = self.write();
        let seq = inner.touch();
        let Some(item) = inner.live(key, now) else {
            return Ok(None);
        };

        let current: u64 = std::str::from_utf8(&item.value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(NonNumericValue)?;
        let updated = if increment {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };

        let old_len = item.value.len();
        item.value = updated.to_string().into_bytes();
        item.last_access = seq;
        let new_len = item.value.len();
        inner.memory_used = inner.memory_used + new_len - old_len;
        Ok(Some(updated))
    }

    /// Remove every item
    pub fn flush_all(&self) {
        let mut inner = self.write();
        let count = inner.items.len();
        inner.items.clear();
        inner.memory_used = 0;
        info!(count, "Flushed all items");
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        StorageStats {
            item_count: inner.items.len(),
            memory_used: inner.memory_used,
            max_memory: self.max_memory,
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub item_count: usize,
    pub memory_used: usize,
    pub max_memory: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_basic_set_get() {
        let storage = Storage::new(1024 * 1024);

        assert_eq!(storage.set("key1", b"value1".to_vec(), 7, 0), StorageResult::Stored);

        let item = storage.get("key1").unwrap();
        assert_eq!(item.value, b"value1");
        assert_eq!(item.flags, 7);
    }

    #[test]
    fn test_add_and_replace() {
        let storage = Storage::new(1024 * 1024);

        assert_eq!(storage.replace("k", b"a".to_vec(), 0, 0), StorageResult::NotStored);
        assert_eq!(storage.add("k", b"a".to_vec(), 0, 0), StorageResult::Stored);
        assert_eq!(storage.add("k", b"b".to_vec(), 0, 0), StorageResult::NotStored);
        assert_eq!(storage.replace("k", b"c".to_vec(), 0, 0), StorageResult::Stored);
        assert_eq!(storage.get("k").unwrap().value, b"c");
    }

    #[test]
    fn test_delete() {
        let storage = Storage::new(1024 * 1024);

        storage.set("key1", b"value1".to_vec(), 0, 0);
        assert_eq!(storage.delete("key1"), StorageResult::Deleted);
        assert_eq!(storage.delete("key1"), StorageResult::NotFound);
        assert!(storage.get("key1").is_none());
        assert_eq!(storage.stats().memory_used, 0);
    }

    #[test]
    fn test_append_prepend() {
        let storage = Storage::new(1024 * 1024);

        assert_eq!(storage.append("key1", b"x"), StorageResult::NotStored);
        storage.set("key1", b"llo".to_vec(), 0, 0);
        assert_eq!(storage.prepend("key1", b"he"), StorageResult::Stored);
        assert_eq!(storage.append("key1", b" world"), StorageResult::Stored);
        assert_eq!(storage.get("key1").unwrap().value, b"hello world");
    }

    #[test]
    fn test_incr_decr() {
        let storage = Storage::new(1024 * 1024);

        assert_eq!(storage.incr_decr("n", 1, true), Ok(None));
        storage.set("n", b"9".to_vec(), 0, 0);
        assert_eq!(storage.incr_decr("n", 1, true), Ok(Some(10)));
        assert_eq!(storage.incr_decr("n", 25, false), Ok(Some(0)));
        assert_eq!(storage.get("n").unwrap().value, b"0");

        storage.set("s", b"abc".to_vec(), 0, 0);
        assert_eq!(storage.incr_decr("s", 1, true), Err(NonNumericValue));
    }

    #[test]
    fn test_expiration() {
        let storage = Storage::new(1024 * 1024);

        storage.set("key1", b"value1".to_vec(), 0, 1);
        assert!(storage.get("key1").is_some());

        thread::sleep(Duration::from_millis(1100));
        assert!(storage.get("key1").is_none());
    }

    #[test]
    fn test_negative_and_absolute_exptime() {
        let storage = Storage::new(1024 * 1024);

        storage.set("gone", b"v".to_vec(), 0, -1);
        assert!(storage.get("gone").is_none());

        let in_an_hour = Utc::now().timestamp() + 3600;
        storage.set("later", b"v".to_vec(), 0, in_an_hour);
        assert!(storage.get("later").is_some());

        storage.set("past", b"v".to_vec(), 0, RELATIVE_EXPTIME_LIMIT + 1);
        assert!(storage.get("past").is_none());
    }

    #[test]
    fn test_memory_limit_evicts_lru() {
        let item_size = CacheItem::footprint("key0", 50);
        let storage = Storage::new(item_size * 3);

        storage.set("key0", vec![0u8; 50], 0, 0);
        storage.set("key1", vec![0u8; 50], 0, 0);
        storage.set("key2", vec![0u8; 50], 0, 0);

        // key0 becomes most recently used
        assert!(storage.get("key0").is_some());
        storage.set("key3", vec![0u8; 50], 0, 0);

        assert!(storage.get("key1").is_none());
        assert!(storage.get("key0").is_some());
        assert!(storage.stats().memory_used <= item_size * 3);
    }

    #[test]
    fn test_oversized_item_refused() {
        let storage = Storage::new(128);
        assert_eq!(storage.set("big", vec![0u8; 256], 0, 0), StorageResult::NotStored);
        assert_eq!(storage.stats().item_count, 0);
    }

    #[test]
    fn test_get_multi() {
        let storage = Storage::new(1024 * 1024);

        storage.set("key1", b"value1".to_vec(), 0, 0);
        storage.set("key2", b"value2".to_vec(), 0, 0);

        let results = storage.get_multi(&["key1", "key2", "nonexistent"]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "key1");
    }

    #[test]
    fn test_flush_all() {
        let storage = Storage::new(1024 * 1024);

        storage.set("key1", b"value1".to_vec(), 0, 0);
        storage.set("key2", b"value2".to_vec(), 0, 0);
        storage.flush_all();

        let stats = storage.stats();
        assert_eq!(stats.item_count, 0);
        assert_eq!(stats.memory_used, 0);
    }
}
