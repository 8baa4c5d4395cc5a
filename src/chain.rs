//! Cache chain orchestrator
//!
//! A [`CacheChain`] owns an ordered list of tiers, fastest first, and runs the
//! cache-aside protocol over them:
//! - Reads walk the tiers in order and stop at the first hit. A hit is not
//!   copied into faster tiers.
//! - When every tier misses, the loader runs once and its result is written
//!   into each visited tier, deepest first.
//! - Batch reads forward only the keys still missing to the next tier, and
//!   the loader sees only the keys no tier had.
//! - Writes fan out to every selected tier concurrently.
//!
//! Tier failures are misses. Loader errors are returned to the caller as-is
//! and never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::CacheError;
use crate::codec::{self, EncodeOptions};
use crate::config::{CacheConfig, RemoteBackend};
use crate::coordinated::{CoordinatedTier, CoordinationSettings};
use crate::instrument::Instrumented;
use crate::invalidation::{InvalidationBus, Origin};
use crate::local::LocalTier;
use crate::options::LoadOptions;
use crate::pubsub::RedisBus;
use crate::remote::{
    DisabledStore, MemoryStore, RedisStore, RemoteStore, RemoteTier, normalize_expiry, unix_now,
};
use crate::tier::{Blob, Locality, Tier};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Expiry of a remembered loader miss: the regular expiry divided by 1024,
/// never less than a second.
pub fn absent_expiry(expire: Duration) -> Duration {
    Duration::from_secs((expire.as_secs() >> 10).max(1))
}

enum Lookup<T> {
    Present(T),
    Absent,
}

/// `None` when the stored bytes cannot be read as `T`.
fn read<T: Cacheable>(blob: &[u8]) -> Option<Lookup<T>> {
    if codec::is_absent_marker(blob) {
        return Some(Lookup::Absent);
    }
    codec::decode(blob).map(Lookup::Present)
}

#[derive(Clone)]
pub struct CacheChain {
    tiers: Arc<[Arc<dyn Tier>]>,
    counters: Option<Arc<RemoteTier>>,
    default_expire: Duration,
    encode: EncodeOptions,
}

impl CacheChain {
    /// Build a chain over `tiers`, index 0 being the fastest.
    pub fn new(tiers: Vec<Arc<dyn Tier>>, config: &CacheConfig) -> Self {
        let tiers: Vec<Arc<dyn Tier>> = if config.instrument_tiers {
            tiers
                .into_iter()
                .map(|tier| Arc::new(Instrumented::new(tier)) as Arc<dyn Tier>)
                .collect()
        } else {
            tiers
        };

        Self {
            tiers: tiers.into(),
            counters: None,
            default_expire: config.default_expire,
            encode: EncodeOptions {
                kind: config.default_encoding,
                compress: config.compress,
            },
        }
    }

    /// Serve `increment`/`decrement` from this remote tier.
    pub fn with_counters(mut self, remote: Arc<RemoteTier>) -> Self {
        self.counters = Some(remote);
        self
    }

    pub fn builder(config: CacheConfig) -> ChainBuilder {
        ChainBuilder::new(config)
    }

    /// Assemble the standard chain described by `config`.
    pub async fn from_config(config: CacheConfig) -> Result<Self, CacheError> {
        Self::builder(config).build().await
    }

    pub fn tiers(&self) -> &[Arc<dyn Tier>] {
        &self.tiers
    }

    /// Cache-aside read of a single key.
    ///
    /// The loader receives the key without its prefix. Its error is returned
    /// unchanged and nothing is cached for it.
    pub async fn load<T, E, F, Fut>(
        &self,
        key: &str,
        loader: F,
        opts: &LoadOptions,
    ) -> Result<Option<T>, E>
    where
        T: Cacheable,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let full_key = opts.full_key(key);
        let tiers = self.select(opts);

        for tier in &tiers {
            let Some(blob) = tier.get(&full_key).await else {
                debug!(key = %full_key, tier = tier.name(), "Cache miss");
                continue;
            };
            match read::<T>(&blob) {
                Some(Lookup::Present(value)) => {
                    debug!(key = %full_key, tier = tier.name(), "Cache hit");
                    return Ok(Some(value));
                }
                Some(Lookup::Absent) => {
                    debug!(key = %full_key, tier = tier.name(), "Cached absent result");
                    return Ok(None);
                }
                None => {}
            }
        }

        let value = loader(key.to_owned()).await?;
        if opts.skip_set_cache {
            return Ok(value);
        }

        match &value {
            Some(v) => self.fill(&tiers, &full_key, v, opts).await,
            None if opts.cache_absent => {
                self.remember_absent(&tiers, vec![full_key.into_owned()], opts)
                    .await
            }
            None => debug!(key = %full_key, "Loader found nothing; not caching"),
        }
        Ok(value)
    }

    /// Cache-aside read of many keys. The result is keyed by the caller's
    /// keys and holds only keys that have a value.
    pub async fn load_multi<T, E, F, Fut>(
        &self,
        keys: &[String],
        loader: F,
        opts: &LoadOptions,
    ) -> Result<HashMap<String, T>, E>
    where
        T: Cacheable,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, T>, E>>,
    {
        // stored key -> caller key
        let mut caller_keys: HashMap<String, String> = HashMap::with_capacity(keys.len());
        let mut pending: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let full_key = opts.full_key(key).into_owned();
            if !caller_keys.contains_key(&full_key) {
                caller_keys.insert(full_key.clone(), key.clone());
                pending.push(full_key);
            }
        }

        let tiers = self.select(opts);
        let mut results: HashMap<String, T> = HashMap::with_capacity(pending.len());

        for tier in &tiers {
            if pending.is_empty() {
                break;
            }
            let mut found = tier.mget(&pending).await;
            let requested = pending.len();
            pending.retain(|full_key| {
                let Some(blob) = found.remove(full_key) else {
                    return true;
                };
                match read::<T>(&blob) {
                    Some(Lookup::Present(value)) => {
                        if let Some(caller_key) = caller_keys.get(full_key) {
                            results.insert(caller_key.clone(), value);
                        }
                        false
                    }
                    Some(Lookup::Absent) => false,
                    None => true,
                }
            });
            debug!(
                tier = tier.name(),
                hits = requested - pending.len(),
                misses = pending.len(),
                "Batch lookup"
            );
        }

        if pending.is_empty() {
            return Ok(results);
        }

        let missing: Vec<String> = pending
            .iter()
            .filter_map(|full_key| caller_keys.get(full_key).cloned())
            .collect();
        let mut loaded = loader(missing).await?;

        let encode = self.encode_options(opts);
        let mut fills: Vec<(String, Blob)> = Vec::new();
        let mut absent: Vec<String> = Vec::new();
        for full_key in pending {
            let Some(caller_key) = caller_keys.get(&full_key) else {
                continue;
            };
            match loaded.remove(caller_key) {
                Some(value) => {
                    if !opts.skip_set_cache {
                        match codec::encode(&value, encode) {
                            Ok(bytes) => fills.push((full_key, Blob::from(bytes))),
                            Err(e) => {
                                warn!(key = %full_key, error = %e, "Unable to encode loaded value; not caching")
                            }
                        }
                    }
                    results.insert(caller_key.clone(), value);
                }
                None => absent.push(full_key),
            }
        }

        if !opts.skip_set_cache {
            if !fills.is_empty() {
                let expire = Some(self.expire(opts));
                for tier in tiers.iter().rev() {
                    tier.mset(fills.clone(), expire).await;
                }
            }
            if opts.cache_absent && !absent.is_empty() {
                self.remember_absent(&tiers, absent, opts).await;
            }
        }

        Ok(results)
    }

    /// Read without a loader.
    pub async fn get<T: Cacheable>(&self, key: &str, opts: &LoadOptions) -> Option<T> {
        let full_key = opts.full_key(key);
        for tier in self.select(opts) {
            let Some(blob) = tier.get(&full_key).await else {
                continue;
            };
            match read::<T>(&blob) {
                Some(Lookup::Present(value)) => return Some(value),
                Some(Lookup::Absent) => return None,
                None => {}
            }
        }
        None
    }

    /// Write to every selected tier concurrently.
    ///
    /// Fails only when the value cannot be encoded.
    pub async fn set<T: Cacheable>(
        &self,
        key: &str,
        value: &T,
        opts: &LoadOptions,
    ) -> Result<(), CacheError> {
        let full_key = opts.full_key(key);
        let blob = Blob::from(codec::encode(value, self.encode_options(opts))?);
        let expire = Some(self.expire(opts));

        join_all(
            self.select(opts)
                .into_iter()
                .map(|tier| tier.set(&full_key, Blob::clone(&blob), expire)),
        )
        .await;
        Ok(())
    }

    pub async fn mset<T, I>(&self, entries: I, opts: &LoadOptions) -> Result<(), CacheError>
    where
        T: Cacheable,
        I: IntoIterator<Item = (String, T)>,
    {
        let encode = self.encode_options(opts);
        let mut encoded: Vec<(String, Blob)> = Vec::new();
        for (key, value) in entries {
            let blob = Blob::from(codec::encode(&value, encode)?);
            encoded.push((opts.full_key(&key).into_owned(), blob));
        }
        if encoded.is_empty() {
            return Ok(());
        }

        let expire = Some(self.expire(opts));
        join_all(
            self.select(opts)
                .into_iter()
                .map(|tier| tier.mset(encoded.clone(), expire)),
        )
        .await;
        Ok(())
    }

    /// Remove a key. In-process tiers are cleared before this returns and
    /// before shared tiers are asked, which happens concurrently.
    pub async fn remove(&self, key: &str, opts: &LoadOptions) {
        let full_key = opts.full_key(key);
        let (in_process, shared): (Vec<_>, Vec<_>) = self
            .select(opts)
            .into_iter()
            .partition(|tier| tier.locality() == Locality::InProcess);

        for tier in in_process {
            tier.remove(&full_key).await;
        }
        join_all(shared.into_iter().map(|tier| tier.remove(&full_key))).await;
    }

    /// Atomically add to a counter held by the remote tier.
    pub async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.counter_tier()?.increment(key, by).await
    }

    pub async fn decrement(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.counter_tier()?.decrement(key, by).await
    }

    /// Clear every available tier.
    pub async fn flush_all(&self) {
        join_all(
            self.tiers
                .iter()
                .filter(|tier| tier.available())
                .map(|tier| tier.clear()),
        )
        .await;
        debug!("All cache tiers flushed");
    }

    fn counter_tier(&self) -> Result<&RemoteTier, CacheError> {
        self.counters
            .as_deref()
            .ok_or(CacheError::TierUnavailable { tier: "remote" })
    }

    fn select(&self, opts: &LoadOptions) -> Vec<&Arc<dyn Tier>> {
        self.tiers
            .iter()
            .enumerate()
            .filter_map(|(index, tier)| {
                if opts.skip_runtime_cache && index == 0 {
                    return None;
                }
                if opts.skip_cache && tier.locality() == Locality::Shared {
                    return None;
                }
                if !tier.available() {
                    debug!(tier = tier.name(), "Skipping unavailable tier");
                    return None;
                }
                Some(tier)
            })
            .collect()
    }

    fn expire(&self, opts: &LoadOptions) -> Duration {
        opts.expire.unwrap_or(self.default_expire)
    }

    fn encode_options(&self, opts: &LoadOptions) -> EncodeOptions {
        EncodeOptions {
            kind: opts.encoding.unwrap_or(self.encode.kind),
            compress: opts.compress.unwrap_or(self.encode.compress),
        }
    }

    async fn fill<T: Cacheable>(
        &self,
        tiers: &[&Arc<dyn Tier>],
        key: &str,
        value: &T,
        opts: &LoadOptions,
    ) {
        let blob = match codec::encode(value, self.encode_options(opts)) {
            Ok(bytes) => Blob::from(bytes),
            Err(e) => {
                warn!(key, error = %e, "Unable to encode loaded value; not caching");
                return;
            }
        };
        let expire = Some(self.expire(opts));
        for tier in tiers.iter().rev() {
            tier.set(key, Blob::clone(&blob), expire).await;
        }
    }

    /// Store absent markers in the shared tiers only; in-process tiers have
    /// no expiry to bound them.
    async fn remember_absent(
        &self,
        tiers: &[&Arc<dyn Tier>],
        keys: Vec<String>,
        opts: &LoadOptions,
    ) {
        let relative = normalize_expiry(self.expire(opts), unix_now()).unwrap_or(0);
        let expire = Some(absent_expiry(Duration::from_secs(relative)));
        let marker = Blob::from(codec::absent_marker());
        let entries: Vec<(String, Blob)> = keys
            .into_iter()
            .map(|key| (key, Blob::clone(&marker)))
            .collect();

        for tier in tiers
            .iter()
            .rev()
            .filter(|tier| tier.locality() == Locality::Shared)
        {
            tier.mset(entries.clone(), expire).await;
        }
        debug!(count = entries.len(), ?expire, "Remembered absent results");
    }
}

/// Assembles `[coordinated or plain local tier, remote tier]` from a
/// [`CacheConfig`], with optional overrides for the store, bus and origin.
/// With `runtime_tier` set, a plain local tier goes in front of the
/// coordinated one, so `skip_runtime_cache` skips only that runtime tier.
pub struct ChainBuilder {
    config: CacheConfig,
    remote_store: Option<Arc<dyn RemoteStore>>,
    bus: Option<Arc<dyn InvalidationBus>>,
    origin: Option<Origin>,
}

impl ChainBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            remote_store: None,
            bus: None,
            origin: None,
        }
    }

    /// Use this store instead of the configured backend.
    pub fn remote_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    /// Coordinate the local tier over this bus.
    pub fn bus(mut self, bus: Arc<dyn InvalidationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Identity stamped on published invalidations; defaults to this
    /// process.
    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub async fn build(self) -> Result<CacheChain, CacheError> {
        let config = self.config;
        let mut redis_parts = None;

        let store: Arc<dyn RemoteStore> = match self.remote_store {
            Some(store) => store,
            None => match &config.remote_backend {
                RemoteBackend::Redis { url } => {
                    let client = redis::Client::open(url.as_str())?;
                    match RedisStore::connect(client.clone()).await {
                        Ok(store) => {
                            redis_parts = Some((client, store.connection()));
                            Arc::new(store)
                        }
                        Err(e) => {
                            warn!(error = %e, "Unable to reach Redis; remote tier disabled");
                            Arc::new(DisabledStore)
                        }
                    }
                }
                RemoteBackend::Memory => Arc::new(MemoryStore::new()),
                RemoteBackend::Disabled => Arc::new(DisabledStore),
            },
        };

        let bus: Option<Arc<dyn InvalidationBus>> = if !config.enable_pubsub {
            None
        } else {
            match self.bus {
                Some(bus) => Some(bus),
                None => redis_parts.map(|(client, conn)| {
                    Arc::new(RedisBus::with_publisher(client, conn)) as Arc<dyn InvalidationBus>
                }),
            }
        };

        let new_local = || {
            LocalTier::with_high_water_mark(
                config.local_max_size,
                config.effective_high_water_mark(),
            )
        };

        let coordinated: Option<Arc<dyn Tier>> = match bus {
            Some(bus) => {
                let origin = self.origin.unwrap_or_else(Origin::current);
                let settings = CoordinationSettings::from_config(&config, origin);
                match CoordinatedTier::start(new_local(), bus, settings).await {
                    Ok(tier) => Some(Arc::new(tier)),
                    Err(e) => {
                        warn!(error = %e, "Invalidation subscription failed; local tier is not coordinated");
                        None
                    }
                }
            }
            None => None,
        };

        let mut tiers: Vec<Arc<dyn Tier>> = Vec::with_capacity(3);
        match coordinated {
            Some(coordinated) => {
                if config.runtime_tier {
                    tiers.push(Arc::new(new_local()));
                }
                tiers.push(coordinated);
            }
            None => tiers.push(Arc::new(new_local())),
        }

        let remote = Arc::new(RemoteTier::new(
            store,
            config.default_expire,
            config.remote_timeout,
        ));
        tiers.push(Arc::clone(&remote) as Arc<dyn Tier>);
        debug!(
            tiers = tiers.len(),
            first = tiers[0].name(),
            remote = remote.store().name(),
            remote_available = remote.store().available(),
            "Cache chain assembled"
        );

        Ok(CacheChain::new(tiers, &config).with_counters(remote))
    }
}
