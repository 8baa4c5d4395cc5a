//! Cache error types

use redis::RedisError;

/// Cache-related errors
///
/// None of these cross the [`Tier`](crate::Tier) boundary: tiers log them and
/// report a miss (reads) or drop the write. They surface from the backend
/// contracts ([`RemoteStore`](crate::RemoteStore),
/// [`InvalidationBus`](crate::InvalidationBus)) and from construction.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Tier {tier} is unavailable")]
    TierUnavailable { tier: &'static str },

    #[error("Tier {tier} failed {op} for key {key}: {message}")]
    TierOperation {
        tier: &'static str,
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("Tier {tier} timed out during {op}")]
    Timeout { tier: &'static str, op: &'static str },

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalidation bus error: {0}")]
    Bus(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Envelope encode/decode errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("decompress: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("unsupported envelope header 0x{0:02x}")]
    UnsupportedHeader(u8),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload does not match the requested type")]
    TypeMismatch,
}
