//! Cache configuration

use std::str::FromStr;
use std::time::Duration;

use crate::CacheError;
use crate::codec::EncodingKind;

/// Which durable store backs the remote tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteBackend {
    Redis { url: String },
    Memory,
    /// No remote tier; the chain treats it as unavailable.
    Disabled,
}

/// Configuration for a cache chain
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Application name, first segment of every invalidation channel
    pub app_name: String,
    /// Cache domain, second segment of every invalidation channel
    pub domain: String,
    /// Maximum number of entries in the in-process tier
    pub local_max_size: u64,
    /// Size at which the in-process tier logs its overflow warning
    pub local_high_water_mark: Option<u64>,
    /// Expiry used by the remote tier when a call does not set one
    pub default_expire: Duration,
    pub remote_backend: RemoteBackend,
    /// Upper bound on any single remote call
    pub remote_timeout: Duration,
    /// Coordinate the in-process tier over pub/sub
    pub enable_pubsub: bool,
    /// Put an uncoordinated runtime tier in front of the coordinated one
    pub runtime_tier: bool,
    /// Periodic full clear of the coordinated tier; disabled when `None`
    pub full_clear_interval: Option<Duration>,
    pub default_encoding: EncodingKind,
    pub compress: bool,
    /// Wrap every tier in the timing decorator
    pub instrument_tiers: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            app_name: "app".to_owned(),
            domain: "global_runtime".to_owned(),
            local_max_size: 1000,
            local_high_water_mark: None,
            default_expire: Duration::from_secs(900), // 15 minutes
            remote_backend: RemoteBackend::Memory,
            remote_timeout: Duration::from_millis(500),
            enable_pubsub: true,
            runtime_tier: false,
            full_clear_interval: None,
            default_encoding: EncodingKind::Json,
            compress: true,
            instrument_tiers: false,
        }
    }
}

impl CacheConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_APP_NAME` - channel prefix (default: `app`)
    /// - `CACHE_DOMAIN` - channel domain (default: `global_runtime`)
    /// - `CACHE_LOCAL_MAX_SIZE` - in-process entries (default: 1000)
    /// - `CACHE_LOCAL_HIGH_WATER` - overflow warning threshold (default: max size)
    /// - `CACHE_DEFAULT_EXPIRE_SECS` - remote expiry (default: 900)
    /// - `CACHE_REMOTE_BACKEND` - `redis`, `memory` or `none` (default: `memory`)
    /// - `CACHE_REDIS_URL` - required for the `redis` backend
    /// - `CACHE_REMOTE_TIMEOUT_MS` - per-call timeout (default: 500)
    /// - `CACHE_ENABLE_PUBSUB` - `true`/`false` (default: `true`)
    /// - `CACHE_RUNTIME_TIER` - `true`/`false` (default: `false`)
    /// - `CACHE_FULL_CLEAR_INTERVAL_MS` - periodic clear (default: disabled)
    /// - `CACHE_ENCODING` - `raw`, `json`, `msgpack` or `bincode` (default: `json`)
    /// - `CACHE_COMPRESS` - `true`/`false` (default: `true`)
    /// - `CACHE_INSTRUMENT_TIERS` - `true`/`false` (default: `false`)
    ///
    /// Unparseable values are rejected rather than defaulted.
    pub fn from_env() -> Result<Self, CacheError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<L>(lookup: L) -> Result<Self, CacheError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |name: &str| value_of(&lookup, name);

        let remote_backend = match text("CACHE_REMOTE_BACKEND").as_deref() {
            None | Some("memory") => RemoteBackend::Memory,
            Some("none") | Some("disabled") => RemoteBackend::Disabled,
            Some("redis") => RemoteBackend::Redis {
                url: text("CACHE_REDIS_URL").ok_or_else(|| {
                    CacheError::Config("CACHE_REDIS_URL is required for the redis backend".to_owned())
                })?,
            },
            Some(other) => {
                return Err(CacheError::Config(format!(
                    "unknown CACHE_REMOTE_BACKEND '{other}'"
                )));
            }
        };

        let default_encoding = match text("CACHE_ENCODING") {
            Some(v) => v
                .parse::<EncodingKind>()
                .map_err(|_| CacheError::Config(format!("unknown CACHE_ENCODING '{v}'")))?,
            None => defaults.default_encoding,
        };

        Ok(Self {
            app_name: text("CACHE_APP_NAME").unwrap_or(defaults.app_name),
            domain: text("CACHE_DOMAIN").unwrap_or(defaults.domain),
            local_max_size: typed(&lookup, "CACHE_LOCAL_MAX_SIZE")?
                .unwrap_or(defaults.local_max_size),
            local_high_water_mark: typed(&lookup, "CACHE_LOCAL_HIGH_WATER")?,
            default_expire: typed(&lookup, "CACHE_DEFAULT_EXPIRE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_expire),
            remote_backend,
            remote_timeout: typed(&lookup, "CACHE_REMOTE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.remote_timeout),
            enable_pubsub: typed(&lookup, "CACHE_ENABLE_PUBSUB")?
                .unwrap_or(defaults.enable_pubsub),
            runtime_tier: typed(&lookup, "CACHE_RUNTIME_TIER")?.unwrap_or(defaults.runtime_tier),
            full_clear_interval: typed(&lookup, "CACHE_FULL_CLEAR_INTERVAL_MS")?
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis),
            default_encoding,
            compress: typed(&lookup, "CACHE_COMPRESS")?.unwrap_or(defaults.compress),
            instrument_tiers: typed(&lookup, "CACHE_INSTRUMENT_TIERS")?
                .unwrap_or(defaults.instrument_tiers),
        })
    }

    /// High-water mark, defaulting to the tier capacity.
    pub fn effective_high_water_mark(&self) -> u64 {
        self.local_high_water_mark.unwrap_or(self.local_max_size)
    }
}

/// Trimmed value of a variable; blank counts as unset.
fn value_of<L>(lookup: &L, name: &str) -> Option<String>
where
    L: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn typed<T, L>(lookup: &L, name: &str) -> Result<Option<T>, CacheError>
where
    T: FromStr,
    L: Fn(&str) -> Option<String>,
{
    match value_of(lookup, name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| CacheError::Config(format!("invalid value '{raw}' for {name}"))),
        None => Ok(None),
    }
}
