//! In-process LRU tier
//!
//! A bounded Moka cache running the LRU eviction policy. There is no TTL:
//! entries stay until they are evicted, removed or cleared. The tier is an
//! accelerator only, so running over its high-water mark logs one warning and
//! keeps going.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::warn;

use crate::tier::{Blob, Locality, Tier};

pub struct LocalTier {
    cache: Cache<String, Blob>,
    max_size: u64,
    high_water_mark: u64,
    overflowed: AtomicBool,
    overflow_warnings: AtomicU64,
}

impl LocalTier {
    /// Create a tier holding at most `max_size` entries, warning once the
    /// tier fills up.
    pub fn new(max_size: u64) -> Self {
        Self::with_high_water_mark(max_size, max_size)
    }

    pub fn with_high_water_mark(max_size: u64, high_water_mark: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_size)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            cache,
            max_size,
            high_water_mark: high_water_mark.min(max_size),
            overflowed: AtomicBool::new(false),
            overflow_warnings: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Blob> {
        self.cache.get(key)
    }

    pub fn set(&self, key: &str, value: Blob) {
        if !self.cache.contains_key(key) && self.cache.entry_count() >= self.high_water_mark {
            self.note_overflow();
        }
        self.cache.insert(key.to_owned(), value);
        // apply the write (and any eviction it causes) before returning
        self.cache.run_pending_tasks();
    }

    pub fn remove(&self, key: &str) {
        self.cache.invalidate(key);
    }

    pub fn mget(&self, keys: &[String]) -> HashMap<String, Blob> {
        keys.iter()
            .filter_map(|k| self.cache.get(k).map(|v| (k.clone(), v)))
            .collect()
    }

    pub fn mset(&self, entries: Vec<(String, Blob)>) {
        for (key, value) in entries {
            self.set(&key, value);
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of overflow warnings emitted; latched at one.
    pub fn overflow_warnings(&self) -> u64 {
        self.overflow_warnings.load(Ordering::Relaxed)
    }

    fn note_overflow(&self) {
        if !self.overflowed.swap(true, Ordering::Relaxed) {
            self.overflow_warnings.fetch_add(1, Ordering::Relaxed);
            warn!(
                max_size = self.max_size,
                high_water_mark = self.high_water_mark,
                "Local cache tier reached its high-water mark; least recently used entries will be evicted"
            );
        }
    }
}

#[async_trait]
impl Tier for LocalTier {
    fn name(&self) -> &'static str {
        "local"
    }

    fn locality(&self) -> Locality {
        Locality::InProcess
    }

    async fn get(&self, key: &str) -> Option<Blob> {
        LocalTier::get(self, key)
    }

    async fn set(&self, key: &str, value: Blob, _expire: Option<Duration>) {
        LocalTier::set(self, key, value)
    }

    async fn remove(&self, key: &str) {
        LocalTier::remove(self, key)
    }

    async fn mget(&self, keys: &[String]) -> HashMap<String, Blob> {
        LocalTier::mget(self, keys)
    }

    async fn mset(&self, entries: Vec<(String, Blob)>, _expire: Option<Duration>) {
        LocalTier::mset(self, entries)
    }

    async fn clear(&self) {
        LocalTier::clear(self)
    }
}
