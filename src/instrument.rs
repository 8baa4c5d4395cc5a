//! Timing decorator for tiers

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::tier::{Blob, Locality, Tier};

/// Wraps a tier, emitting a `debug!` event with the elapsed time of every
/// call and counting read hits and misses.
pub struct Instrumented<T: ?Sized = dyn Tier> {
    inner: Arc<T>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T: Tier + ?Sized> Instrumented<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    /// Keys served by `get` and `mget`.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Keys requested but not served by `get` and `mget`.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn record(&self, hits: usize, misses: usize) {
        self.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.misses.fetch_add(misses as u64, Ordering::Relaxed);
    }

    fn trace(&self, op: &'static str, keys: usize, started: Instant) {
        debug!(
            tier = self.inner.name(),
            op,
            keys,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Tier call"
        );
    }
}

#[async_trait]
impl<T: Tier + ?Sized> Tier for Instrumented<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn locality(&self) -> Locality {
        self.inner.locality()
    }

    fn available(&self) -> bool {
        self.inner.available()
    }

    async fn get(&self, key: &str) -> Option<Blob> {
        let started = Instant::now();
        let value = self.inner.get(key).await;
        if value.is_some() {
            self.record(1, 0);
        } else {
            self.record(0, 1);
        }
        self.trace("get", 1, started);
        value
    }

    async fn set(&self, key: &str, value: Blob, expire: Option<Duration>) {
        let started = Instant::now();
        self.inner.set(key, value, expire).await;
        self.trace("set", 1, started);
    }

    async fn remove(&self, key: &str) {
        let started = Instant::now();
        self.inner.remove(key).await;
        self.trace("remove", 1, started);
    }

    async fn mget(&self, keys: &[String]) -> HashMap<String, Blob> {
        let started = Instant::now();
        let found = self.inner.mget(keys).await;
        self.record(found.len(), keys.len().saturating_sub(found.len()));
        self.trace("mget", keys.len(), started);
        found
    }

    async fn mset(&self, entries: Vec<(String, Blob)>, expire: Option<Duration>) {
        let started = Instant::now();
        let count = entries.len();
        self.inner.mset(entries, expire).await;
        self.trace("mset", count, started);
    }

    async fn clear(&self) {
        let started = Instant::now();
        self.inner.clear().await;
        self.trace("clear", 0, started);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTier;

    #[tokio::test]
    async fn test_counts_hits_and_misses() {
        let tier = Instrumented::new(Arc::new(LocalTier::new(10)));
        tier.set("a", Blob::from(&b"1"[..]), None).await;

        assert!(tier.get("a").await.is_some());
        assert!(tier.get("b").await.is_none());
        let found = tier
            .mget(&["a".to_owned(), "b".to_owned(), "c".to_owned()])
            .await;

        assert_eq!(found.len(), 1);
        assert_eq!(tier.hits(), 2);
        assert_eq!(tier.misses(), 3);
    }

    #[tokio::test]
    async fn test_delegates_identity() {
        let inner: Arc<dyn Tier> = Arc::new(LocalTier::new(10));
        let tier = Instrumented::new(inner);
        assert_eq!(tier.name(), "local");
        assert_eq!(tier.locality(), Locality::InProcess);
        assert!(tier.available());
    }
}
