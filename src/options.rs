//! Per-call options for chain operations

use std::borrow::Cow;
use std::time::Duration;

use crate::codec::EncodingKind;

/// Options accepted by every [`CacheChain`](crate::CacheChain) operation.
///
/// `skip_runtime_cache` drops the first (in-process) tier, `skip_cache` drops
/// every shared tier; set both to bypass the cache entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub skip_cache: bool,
    pub skip_runtime_cache: bool,
    /// Do not fill tiers with what the loader returns
    pub skip_set_cache: bool,
    /// Expiry for shared tiers; the chain default when `None`
    pub expire: Option<Duration>,
    /// Prepended to every key the call touches
    pub key_prefix: Option<String>,
    pub encoding: Option<EncodingKind>,
    pub compress: Option<bool>,
    /// Remember loader misses with a shortened expiry
    pub cache_absent: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn skip_runtime_cache(mut self) -> Self {
        self.skip_runtime_cache = true;
        self
    }

    pub fn skip_set_cache(mut self) -> Self {
        self.skip_set_cache = true;
        self
    }

    pub fn cache_absent(mut self) -> Self {
        self.cache_absent = true;
        self
    }

    pub fn with_expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_encoding(mut self, kind: EncodingKind) -> Self {
        self.encoding = Some(kind);
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    /// The key as stored in the tiers.
    pub fn full_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match self.key_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => Cow::Owned(format!("{prefix}{key}")),
            _ => Cow::Borrowed(key),
        }
    }
}
