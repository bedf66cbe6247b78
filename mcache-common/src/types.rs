//! # Item Types
//!
//! Values returned by classic and meta retrievals, plus the key/value
//! constraints every command builder enforces.
//!
//! ## Design Principles
//!
//! 1. **Opaque Payloads**: Values are `Bytes`; the library never interprets them.
//! 2. **Populate On Request**: `MetaItem` fields stay at their defaults unless
//!    the matching response flag was asked for.

use bytes::Bytes;

use crate::error::{McError, McResult};

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: u64 = u32::MAX as u64;

/// Item returned by classic retrieval commands.
///
/// `cas` is populated only by `gets` / `gats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// Item returned by meta commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaItem {
    /// Key as echoed by the `k` flag. With `b` this is the base64 wire form.
    pub key: Bytes,
    pub value: Bytes,
    pub cas: u64,
    pub flags: u32,
    /// Remaining TTL in seconds, `-1` when the item never expires.
    pub ttl: i64,
    /// Seconds since last access.
    pub last_accessed_time: i64,
    pub size: u64,
    pub opaque: u64,
    pub hit_before: bool,
    /// `W`: this client won the right to recache.
    pub won: bool,
    /// `X`: the item is stale.
    pub stale: bool,
    /// `Z`: a recache token was already handed out.
    pub win_sent: bool,
}

impl Default for MetaItem {
    fn default() -> Self {
        MetaItem {
            key: Bytes::new(),
            value: Bytes::new(),
            cas: 0,
            flags: 0,
            ttl: -1,
            last_accessed_time: 0,
            size: 0,
            opaque: 0,
            hit_before: false,
            won: false,
            stale: false,
            win_sent: false,
        }
    }
}

/// Validates a key for the text protocol.
pub fn validate_key(key: &[u8]) -> McResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(McError::InvalidKey);
    }
    if key.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(McError::InvalidKey);
    }
    Ok(())
}

/// Validates a key that will travel base64-encoded (meta `b` flag).
///
/// Any byte is allowed; only the length is bounded.
pub fn validate_binary_key(key: &[u8]) -> McResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(McError::InvalidKey);
    }
    Ok(())
}

pub fn validate_value(value: &[u8]) -> McResult<()> {
    if value.len() as u64 > MAX_VALUE_LEN {
        return Err(McError::InvalidValue);
    }
    Ok(())
}
