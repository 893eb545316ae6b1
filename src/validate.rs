//! # Byte/UTF-8 Validators
//!
//! Every string entering the core passes through this module. Size caps are
//! counted in UTF-8 **bytes**, never code points: a key of 86 `€` characters
//! is 258 bytes and therefore too long, even though it is only 86 characters.
//!
//! The caps are enforced at every boundary: command input, codec input,
//! codec output, and storage put. Raw transport bytes are checked with
//! [`require_utf8`], which rejects lone surrogates, overlong encodings and
//! truncated sequences (none of them are well-formed UTF-8).

use crate::error::{Error, Result};

/// Maximum key size in UTF-8 bytes.
pub const MAX_KEY_BYTES: usize = 256;

/// Maximum value size in UTF-8 bytes.
pub const MAX_VALUE_BYTES: usize = 262_144;

/// Maximum size of a whole encoded bulk request in bytes.
pub const MAX_BULK_PAYLOAD_BYTES: usize = 524_288;

/// Maximum size of an encoded replication event in bytes.
pub const MAX_EVENT_BYTES: usize = 307_200;

/// Maximum number of keys accepted by MGET.
pub const MAX_MGET_KEYS: usize = 256;

/// Maximum number of pairs accepted by MSET.
pub const MAX_MSET_PAIRS: usize = 100;

/// Maximum length of a node id in characters.
pub const MAX_NODE_ID_CHARS: usize = 128;

/// Validate a key: non-empty, at most [`MAX_KEY_BYTES`] UTF-8 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_request("key must not be empty"));
    }
    let len = key.len();
    if len > MAX_KEY_BYTES {
        return Err(Error::invalid_request(format!(
            "Key size {} exceeds maximum allowed ({} bytes)",
            len, MAX_KEY_BYTES
        )));
    }
    Ok(())
}

/// Validate a value against [`MAX_VALUE_BYTES`]. Empty values are legal.
pub fn validate_value(value: &str) -> Result<()> {
    let len = value.len();
    if len > MAX_VALUE_BYTES {
        return Err(Error::payload_too_large(format!(
            "Value size {} exceeds maximum allowed ({} bytes)",
            len, MAX_VALUE_BYTES
        )));
    }
    Ok(())
}

/// Validate the size of a whole encoded bulk request.
pub fn validate_bulk_payload(encoded_len: usize) -> Result<()> {
    if encoded_len > MAX_BULK_PAYLOAD_BYTES {
        return Err(Error::payload_too_large(format!(
            "Request size {} exceeds maximum allowed ({} bytes)",
            encoded_len, MAX_BULK_PAYLOAD_BYTES
        )));
    }
    Ok(())
}

/// Validate the size of an encoded replication event.
pub fn validate_event_size(encoded_len: usize) -> Result<()> {
    if encoded_len > MAX_EVENT_BYTES {
        return Err(Error::payload_too_large(format!(
            "Encoded event size {} exceeds maximum allowed ({} bytes)",
            encoded_len, MAX_EVENT_BYTES
        )));
    }
    Ok(())
}

/// Validate a node id: non-empty, at most [`MAX_NODE_ID_CHARS`] characters.
pub fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.is_empty() {
        return Err(Error::invalid_request("node_id must not be empty"));
    }
    if node_id.chars().count() > MAX_NODE_ID_CHARS {
        return Err(Error::invalid_request(format!(
            "node_id exceeds maximum allowed ({} chars)",
            MAX_NODE_ID_CHARS
        )));
    }
    Ok(())
}

/// Check raw transport bytes for well-formed UTF-8.
///
/// `std::str::from_utf8` already rejects lone surrogates, overlong encodings
/// and truncated sequences, which is exactly the contract we need.
pub fn require_utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|e| Error::invalid_request(format!("payload is not valid UTF-8: {}", e)))
}
