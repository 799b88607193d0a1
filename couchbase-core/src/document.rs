//! Payload model for document values.
//!
//! The data path treats a document as an opaque byte range plus a 32-bit
//! flags word. This module gives those bytes a shape: a small sum type over
//! the payload kinds the client understands, with the format recorded in the
//! top byte of the flags word. Applications with their own representations
//! plug in through the [`Transcoder`] trait.

use bytes::Bytes;

use crate::error::{CouchbaseError, Result};

/// Format tag stored in the top byte of the flags word.
const FORMAT_JSON: u32 = 0x02;
const FORMAT_BINARY: u32 = 0x03;
const FORMAT_UTF8: u32 = 0x04;
const FORMAT_INTEGER64: u32 = 0x05;
const FORMAT_FLOAT64: u32 = 0x06;

const FORMAT_SHIFT: u32 = 24;

/// A decoded document payload.
///
/// Integer and float payloads are encoded big-endian on the wire regardless
/// of the host byte order.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    /// Raw bytes, passed through untouched.
    Binary(Bytes),
    /// A UTF-8 string.
    Utf8(String),
    /// A JSON document.
    Json(serde_json::Value),
    /// A 64-bit signed integer.
    Integer64(i64),
    /// A 64-bit float.
    Float64(f64),
}

impl PayloadValue {
    /// Returns the flags word describing this payload's format.
    pub fn flags(&self) -> u32 {
        let format = match self {
            Self::Binary(_) => FORMAT_BINARY,
            Self::Utf8(_) => FORMAT_UTF8,
            Self::Json(_) => FORMAT_JSON,
            Self::Integer64(_) => FORMAT_INTEGER64,
            Self::Float64(_) => FORMAT_FLOAT64,
        };
        format << FORMAT_SHIFT
    }

    /// Encodes this payload into wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Self::Binary(bytes) => Ok(bytes.clone()),
            Self::Utf8(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Self::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CouchbaseError::Serialization(format!("JSON encode: {}", e))),
            Self::Integer64(value) => Ok(Bytes::copy_from_slice(&value.to_be_bytes())),
            Self::Float64(value) => Ok(Bytes::copy_from_slice(&value.to_be_bytes())),
        }
    }

    /// Decodes wire bytes according to the flags word.
    ///
    /// Unknown format tags fall back to `Binary`, preserving the bytes for
    /// a user transcoder.
    pub fn decode(flags: u32, body: &[u8]) -> Result<Self> {
        match flags >> FORMAT_SHIFT {
            FORMAT_UTF8 => String::from_utf8(body.to_vec())
                .map(Self::Utf8)
                .map_err(|e| CouchbaseError::Serialization(format!("invalid UTF-8: {}", e))),
            FORMAT_JSON => serde_json::from_slice(body)
                .map(Self::Json)
                .map_err(|e| CouchbaseError::Serialization(format!("JSON decode: {}", e))),
            FORMAT_INTEGER64 => {
                let raw: [u8; 8] = body.try_into().map_err(|_| {
                    CouchbaseError::Serialization(format!(
                        "integer payload must be 8 bytes, got {}",
                        body.len()
                    ))
                })?;
                Ok(Self::Integer64(i64::from_be_bytes(raw)))
            }
            FORMAT_FLOAT64 => {
                let raw: [u8; 8] = body.try_into().map_err(|_| {
                    CouchbaseError::Serialization(format!(
                        "float payload must be 8 bytes, got {}",
                        body.len()
                    ))
                })?;
                Ok(Self::Float64(f64::from_be_bytes(raw)))
            }
            _ => Ok(Self::Binary(Bytes::copy_from_slice(body))),
        }
    }
}

/// Hook for application-defined payload representations.
///
/// The default implementation handles the [`PayloadValue`] formats; custom
/// transcoders can map arbitrary user types onto bytes and flags.
pub trait Transcoder: Send + Sync {
    /// Encodes a payload into wire bytes and the matching flags word.
    fn encode(&self, value: &PayloadValue) -> Result<(Bytes, u32)>;

    /// Decodes wire bytes with the given flags word.
    fn decode(&self, flags: u32, body: &[u8]) -> Result<PayloadValue>;
}

/// The built-in transcoder over the payload sum type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTranscoder;

impl Transcoder for DefaultTranscoder {
    fn encode(&self, value: &PayloadValue) -> Result<(Bytes, u32)> {
        Ok((value.encode()?, value.flags()))
    }

    fn decode(&self, flags: u32, body: &[u8]) -> Result<PayloadValue> {
        PayloadValue::decode(flags, body)
    }
}
