//! Remote durable tier
//!
//! [`RemoteStore`] is the small contract a backing store implements.
//! [`RemoteTier`] adapts any store to the chain: it hashes long keys, turns
//! timestamp-looking expiries into relative ones, bounds every call with a
//! timeout and converts failures into misses.

mod memory_store;
mod redis_store;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::CacheError;
use crate::tier::{Blob, Locality, Tier};

/// Keys longer than this are hashed before reaching the store.
pub const MAX_KEY_LENGTH: usize = 48;

/// Expiries at or above this many seconds are read as unix timestamps.
pub const THIRTY_DAYS_SECS: u64 = 30 * 24 * 60 * 60;

/// Operations a durable backing store provides.
///
/// `expire_secs` of `None` stores without expiry.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], expire_secs: Option<u64>)
    -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// One slot per requested key, in order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    async fn mset(
        &self,
        entries: &[(String, Blob)],
        expire_secs: Option<u64>,
    ) -> Result<(), CacheError> {
        for (key, value) in entries {
            self.set(key, value, expire_secs).await?;
        }
        Ok(())
    }

    /// Atomically add `by` and return the new value.
    async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError>;

    async fn decrement(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.increment(key, -by).await
    }

    async fn flush_all(&self) -> Result<(), CacheError>;
}

/// Store used when no backend is configured; always unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStore;

#[async_trait]
impl RemoteStore for DisabledStore {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn available(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(CacheError::TierUnavailable { tier: "disabled" })
    }

    async fn set(&self, _key: &str, _value: &[u8], _expire: Option<u64>) -> Result<(), CacheError> {
        Err(CacheError::TierUnavailable { tier: "disabled" })
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::TierUnavailable { tier: "disabled" })
    }

    async fn increment(&self, _key: &str, _by: i64) -> Result<i64, CacheError> {
        Err(CacheError::TierUnavailable { tier: "disabled" })
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        Err(CacheError::TierUnavailable { tier: "disabled" })
    }
}

/// Hash keys the backend may reject for length.
pub fn normalize_key(key: &str) -> Cow<'_, str> {
    if key.len() > MAX_KEY_LENGTH {
        Cow::Owned(hex::encode(Sha256::digest(key.as_bytes())))
    } else {
        Cow::Borrowed(key)
    }
}

/// Relative expiry in seconds to hand to the backend.
///
/// Zero means no expiry. Values of thirty days or more are taken as absolute
/// unix timestamps; one already in the past expires after a second.
pub fn normalize_expiry(expire: Duration, now_secs: u64) -> Option<u64> {
    let secs = expire.as_secs();
    if secs == 0 {
        return None;
    }
    if secs >= THIRTY_DAYS_SECS {
        return Some(secs.saturating_sub(now_secs).max(1));
    }
    Some(secs)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Chain adapter around a [`RemoteStore`].
pub struct RemoteTier {
    store: Arc<dyn RemoteStore>,
    default_expire: Duration,
    timeout: Duration,
}

impl RemoteTier {
    pub fn new(store: Arc<dyn RemoteStore>, default_expire: Duration, timeout: Duration) -> Self {
        Self {
            store,
            default_expire,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Counters are not cache reads, so their failures are returned.
    pub async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.ensure_available()?;
        let key = normalize_key(key);
        self.bounded("increment", self.store.increment(&key, by))
            .await
    }

    pub async fn decrement(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.ensure_available()?;
        let key = normalize_key(key);
        self.bounded("decrement", self.store.decrement(&key, by))
            .await
    }

    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.store.available() {
            Ok(())
        } else {
            Err(CacheError::TierUnavailable {
                tier: self.store.name(),
            })
        }
    }

    fn expiry(&self, expire: Option<Duration>) -> Option<u64> {
        normalize_expiry(expire.unwrap_or(self.default_expire), unix_now())
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout {
                tier: self.store.name(),
                op,
            }),
        }
    }

    /// Run a store call, logging and swallowing any failure.
    async fn guarded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match self.bounded(op, fut).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(tier = self.store.name(), op, key, error = %e, "Remote tier operation failed; continuing");
                None
            }
        }
    }
}

#[async_trait]
impl Tier for RemoteTier {
    fn name(&self) -> &'static str {
        self.store.name()
    }

    fn locality(&self) -> Locality {
        Locality::Shared
    }

    fn available(&self) -> bool {
        self.store.available()
    }

    async fn get(&self, key: &str) -> Option<Blob> {
        let store_key = normalize_key(key);
        self.guarded("get", key, self.store.get(&store_key))
            .await
            .flatten()
            .map(Blob::from)
    }

    async fn set(&self, key: &str, value: Blob, expire: Option<Duration>) {
        let store_key = normalize_key(key);
        let expire_secs = self.expiry(expire);
        self.guarded("set", key, self.store.set(&store_key, &value, expire_secs))
            .await;
    }

    async fn remove(&self, key: &str) {
        let store_key = normalize_key(key);
        self.guarded("remove", key, self.store.remove(&store_key))
            .await;
    }

    async fn mget(&self, keys: &[String]) -> HashMap<String, Blob> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let store_keys: Vec<String> = keys.iter().map(|k| normalize_key(k).into_owned()).collect();
        let Some(values) = self
            .guarded("mget", "<batch>", self.store.mget(&store_keys))
            .await
        else {
            return HashMap::new();
        };

        if values.len() != keys.len() {
            warn!(
                tier = self.store.name(),
                requested = keys.len(),
                returned = values.len(),
                "Remote mget returned a mismatched batch; ignoring it"
            );
            return HashMap::new();
        }

        keys.iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), Blob::from(v))))
            .collect()
    }

    async fn mset(&self, entries: Vec<(String, Blob)>, expire: Option<Duration>) {
        if entries.is_empty() {
            return;
        }
        let expire_secs = self.expiry(expire);
        let entries: Vec<(String, Blob)> = entries
            .into_iter()
            .map(|(k, v)| (normalize_key(&k).into_owned(), v))
            .collect();
        let count = entries.len();
        if self
            .guarded("mset", "<batch>", self.store.mset(&entries, expire_secs))
            .await
            .is_some()
        {
            debug!(tier = self.store.name(), count, "Remote batch written");
        }
    }

    async fn clear(&self) {
        self.guarded("flush_all", "*", self.store.flush_all()).await;
    }
}
