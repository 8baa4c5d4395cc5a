//! Binary envelope codec
//!
//! Every value a tier stores is a single header byte followed by the payload:
//!
//! ```text
//!  bit   7    6 5     4 3     2 1    0
//!      +----+-------+-------+------+----+
//!      | 1  |  0 1  |  0 0  | kind | z  |
//!      +----+-------+-------+------+----+
//!      marker version reserved       compressed
//! ```
//!
//! `kind` selects the payload encoding (raw text/bytes, JSON, MessagePack or a
//! bincode snapshot). Buffers whose top three bits are not `101` were written
//! without a header and are decoded best-effort: JSON first, then as a plain
//! string. Numbers are always written unframed so they stay readable by
//! anything that speaks JSON.

use std::any::{Any, TypeId};
use std::str::FromStr;

use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::CodecError;

/// Mask selecting the marker and version bits of the header.
pub const MARKER_MASK: u8 = 0xE0;
/// Marker bit set plus format version 01.
pub const MARKER: u8 = 0xA0;
const RESERVED_MASK: u8 = 0x18;
const KIND_MASK: u8 = 0x06;
const COMPRESSED_BIT: u8 = 0x01;

/// Payloads at or below this many bytes are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 64;

/// Payload encoding recorded in bits 1-2 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncodingKind {
    /// Text or bytes stored as-is
    Raw,
    /// serde_json
    #[default]
    Json,
    /// MessagePack (rmp-serde, named fields)
    StructuredBinary,
    /// bincode snapshot of the exact Rust type
    NativeBinary,
}

impl EncodingKind {
    fn bits(self) -> u8 {
        match self {
            EncodingKind::Raw => 0b00,
            EncodingKind::Json => 0b01,
            EncodingKind::StructuredBinary => 0b10,
            EncodingKind::NativeBinary => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => EncodingKind::Raw,
            0b01 => EncodingKind::Json,
            0b10 => EncodingKind::StructuredBinary,
            _ => EncodingKind::NativeBinary,
        }
    }
}

impl FromStr for EncodingKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(EncodingKind::Raw),
            "json" => Ok(EncodingKind::Json),
            "msgpack" | "structured" => Ok(EncodingKind::StructuredBinary),
            "bincode" | "native" => Ok(EncodingKind::NativeBinary),
            _ => Err(CodecError::TypeMismatch),
        }
    }
}

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: EncodingKind,
    pub compressed: bool,
}

impl Header {
    pub fn new(kind: EncodingKind, compressed: bool) -> Self {
        Self { kind, compressed }
    }

    pub fn to_byte(self) -> u8 {
        MARKER | (self.kind.bits() << 1) | u8::from(self.compressed)
    }

    /// Parse a header byte. Fails for unframed bytes and for headers using
    /// the reserved bits.
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        if !is_framed(byte) || byte & RESERVED_MASK != 0 {
            return Err(CodecError::UnsupportedHeader(byte));
        }
        Ok(Self {
            kind: EncodingKind::from_bits((byte & KIND_MASK) >> 1),
            compressed: byte & COMPRESSED_BIT != 0,
        })
    }

    /// Header of an encoded buffer, if it has one.
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        bytes.first().and_then(|b| Self::from_byte(*b).ok())
    }
}

/// True when `byte` carries the envelope marker.
pub fn is_framed(byte: u8) -> bool {
    byte & MARKER_MASK == MARKER
}

/// Options controlling [`encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub kind: EncodingKind,
    pub compress: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            kind: EncodingKind::Json,
            compress: true,
        }
    }
}

/// Encode a value into an envelope.
///
/// Strings and byte vectors skip structured encoding. Numbers are written as
/// bare JSON. `NativeBinary` falls back to `StructuredBinary` and then to
/// `Json` when the type cannot be represented.
pub fn encode<T>(value: &T, options: EncodeOptions) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + 'static,
{
    let any = value as &dyn Any;
    if is_number(any) {
        return Ok(serde_json::to_vec(value)?);
    }

    let (kind, payload) = if let Some(text) = any.downcast_ref::<String>() {
        (EncodingKind::Raw, text.as_bytes().to_vec())
    } else if let Some(text) = any.downcast_ref::<&'static str>() {
        (EncodingKind::Raw, text.as_bytes().to_vec())
    } else if let Some(bytes) = any.downcast_ref::<Vec<u8>>() {
        (EncodingKind::Raw, bytes.clone())
    } else {
        serialize_structured(value, options.kind)?
    };

    Ok(frame(kind, payload, options.compress))
}

/// Decode an envelope, treating any failure as absent.
pub fn decode<T>(bytes: &[u8]) -> Option<T>
where
    T: DeserializeOwned + 'static,
{
    match try_decode(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, len = bytes.len(), "Failed to decode cached value; treating as miss");
            None
        }
    }
}

/// Decode an envelope, reporting why it could not be read.
pub fn try_decode<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned + 'static,
{
    let Some((&first, rest)) = bytes.split_first() else {
        return decode_legacy(bytes);
    };
    if !is_framed(first) {
        return decode_legacy(bytes);
    }

    let header = Header::from_byte(first)?;
    let inflated;
    let payload = if header.compressed {
        inflated = lz4_flex::decompress_size_prepended(rest)?;
        &inflated[..]
    } else {
        rest
    };

    match header.kind {
        EncodingKind::Raw => decode_raw(payload),
        EncodingKind::Json => Ok(serde_json::from_slice(payload)?),
        EncodingKind::StructuredBinary => Ok(rmp_serde::from_slice(payload)?),
        EncodingKind::NativeBinary => Ok(bincode::deserialize(payload)?),
    }
}

/// Envelope stored for a loader result that is known to be absent.
///
/// A compressed header with no body: [`encode`] only compresses payloads
/// above the threshold, so no encoded value can look like this.
pub fn absent_marker() -> Vec<u8> {
    vec![Header::new(EncodingKind::Json, true).to_byte()]
}

pub fn is_absent_marker(bytes: &[u8]) -> bool {
    bytes == [Header::new(EncodingKind::Json, true).to_byte()]
}

fn frame(kind: EncodingKind, payload: Vec<u8>, compress: bool) -> Vec<u8> {
    let compressed = compress && payload.len() > COMPRESSION_THRESHOLD;
    let body = if compressed {
        lz4_flex::compress_prepend_size(&payload)
    } else {
        payload
    };

    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(Header::new(kind, compressed).to_byte());
    out.extend_from_slice(&body);
    out
}

fn serialize_structured<T: Serialize>(
    value: &T,
    kind: EncodingKind,
) -> Result<(EncodingKind, Vec<u8>), CodecError> {
    if kind == EncodingKind::NativeBinary {
        match bincode::serialize(value) {
            Ok(payload) => return Ok((EncodingKind::NativeBinary, payload)),
            Err(e) => debug!(error = %e, "Native binary encoding failed, trying structured binary"),
        }
    }

    if matches!(
        kind,
        EncodingKind::NativeBinary | EncodingKind::StructuredBinary
    ) {
        match rmp_serde::to_vec_named(value) {
            Ok(payload) => return Ok((EncodingKind::StructuredBinary, payload)),
            Err(e) => debug!(error = %e, "Structured binary encoding failed, falling back to JSON"),
        }
    }

    Ok((EncodingKind::Json, serde_json::to_vec(value)?))
}

fn decode_raw<T>(payload: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned + 'static,
{
    if TypeId::of::<T>() == TypeId::of::<Vec<u8>>() {
        return downcast(payload.to_vec());
    }
    if TypeId::of::<T>() == TypeId::of::<String>() {
        let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
        return downcast(text.to_owned());
    }
    decode_legacy(payload)
}

/// Unframed data: JSON if it parses, otherwise the text itself.
fn decode_legacy<T>(bytes: &[u8]) -> Result<T, CodecError>
where
    T: DeserializeOwned + 'static,
{
    if let Ok(value) = serde_json::from_slice::<T>(bytes) {
        return Ok(value);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
    let de: serde::de::value::StrDeserializer<'_, serde::de::value::Error> =
        text.into_deserializer();
    T::deserialize(de).map_err(|_| CodecError::TypeMismatch)
}

fn downcast<T: 'static, U: 'static>(value: U) -> Result<T, CodecError> {
    (Box::new(value) as Box<dyn Any>)
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| CodecError::TypeMismatch)
}

fn is_number(any: &dyn Any) -> bool {
    macro_rules! any_of {
        ($($t:ty),*) => { false $(|| any.is::<$t>())* };
    }
    any_of!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64)
}
