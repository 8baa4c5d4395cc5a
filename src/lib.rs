//! tiercache - Layered cache-aside library
//!
//! This library provides a chain of cache tiers behind one cache-aside API:
//! - In-process LRU tier (fastest, size-bounded, no TTL)
//! - Coordinated in-process tier kept coherent across processes over pub/sub
//! - Remote tier over a shared store (Redis or in-memory), honoring expiry
//!
//! The cache supports:
//! - Fallthrough between tiers with fill-on-miss after the loader runs
//! - Batch reads that forward only the missing keys
//! - Cross-process invalidation with self-echo suppression
//! - Short-lived caching of absent results
//! - A single-byte-header envelope codec (raw, JSON, MessagePack, bincode, LZ4)
//!
//! Any tier failure degrades to a miss; loader errors reach the caller.

mod chain;
pub mod codec;
mod config;
mod coordinated;
mod error;
mod instrument;
pub mod invalidation;
mod local;
mod namespace;
mod options;
mod pubsub;
pub mod remote;
mod task;
mod tier;

pub use chain::{CacheChain, Cacheable, ChainBuilder, absent_expiry};
pub use codec::{EncodeOptions, EncodingKind};
pub use config::{CacheConfig, RemoteBackend};
pub use coordinated::{CoordinatedTier, CoordinationSettings};
pub use error::{CacheError, CodecError};
pub use instrument::Instrumented;
pub use invalidation::{InvalidationBus, MemoryBus, Origin};
pub use local::LocalTier;
pub use namespace::{BoxError, DataFetcher, NamespacedCache};
pub use options::LoadOptions;
pub use pubsub::RedisBus;
pub use remote::{DisabledStore, MemoryStore, RedisStore, RemoteStore, RemoteTier};
pub use task::spawn_detached;
pub use tier::{Blob, Locality, Tier};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
