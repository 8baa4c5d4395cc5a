//! The contract every cache tier implements

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// An encoded envelope as stored by a tier.
pub type Blob = Arc<[u8]>;

/// Where a tier keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locality {
    /// Lives in this process; no TTL, size-bounded.
    InProcess,
    /// Shared with other processes; honors expiry.
    Shared,
}

/// A single layer of the cache chain.
///
/// Implementations never return errors: a failing read is a miss and a
/// failing write is dropped, after being logged by the tier itself.
#[async_trait]
pub trait Tier: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn locality(&self) -> Locality;

    /// A tier that is not available is skipped by the chain.
    fn available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Option<Blob>;

    async fn set(&self, key: &str, value: Blob, expire: Option<Duration>);

    async fn remove(&self, key: &str);

    /// Returns only the keys this tier holds.
    async fn mget(&self, keys: &[String]) -> HashMap<String, Blob>;

    async fn mset(&self, entries: Vec<(String, Blob)>, expire: Option<Duration>);

    async fn clear(&self);
}
