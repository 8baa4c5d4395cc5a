//! In-process key/value store with expiry
//!
//! Behaves like a single-node remote store: values expire, counters are
//! stored as decimal text. Used in tests and single-process deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::CacheError;
use crate::remote::RemoteStore;
use crate::tier::Blob;

struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: Vec<u8>, expire_secs: Option<u64>) -> Self {
        Self {
            value,
            expires_at: expire_secs.map(|s| Instant::now() + Duration::from_secs(s)),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of a live key; `None` for missing keys and keys
    /// without expiry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    pub async fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries.get(key).is_some_and(|e| e.is_live(Instant::now()))
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(e) if e.is_live(now) => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // expired: drop it
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], expire_secs: Option<u64>) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), StoredValue::new(value.to_vec(), expire_secs));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|k| {
                entries
                    .get(k)
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value.clone())
            })
            .collect())
    }

    async fn mset(&self, entries: &[(String, Blob)], expire_secs: Option<u64>) -> Result<(), CacheError> {
        let mut stored = self.entries.write().await;
        for (key, value) in entries {
            stored.insert(key.clone(), StoredValue::new(value.to_vec(), expire_secs));
        }
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        let (current, expires_at) = match entries.get(key).filter(|e| e.is_live(now)) {
            Some(e) => {
                let parsed = std::str::from_utf8(&e.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok())
                    .ok_or_else(|| CacheError::TierOperation {
                        tier: "memory",
                        op: "increment",
                        key: key.to_owned(),
                        message: "value is not an integer".to_owned(),
                    })?;
                (parsed, e.expires_at)
            }
            None => (0, None),
        };

        let next = current.checked_add(by).ok_or_else(|| CacheError::TierOperation {
            tier: "memory",
            op: "increment",
            key: key.to_owned(),
            message: "increment would overflow".to_owned(),
        })?;

        entries.insert(
            key.to_owned(),
            StoredValue {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}
