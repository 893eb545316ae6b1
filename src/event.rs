//! # Replication Event Codec
//!
//! Wire projection of a storage write plus its deterministic binary codec.
//! Events travel between replicas as CBOR maps with a fixed field order:
//! `key, node_id, seq, timestamp_ms, tombstone`, and `value` only when the
//! event is not a tombstone. Serialization follows struct declaration order,
//! so two encodes of equal events are bitwise identical, and integers take
//! their shortest CBOR form.
//!
//! The decoder is strict: it re-validates the reconstructed event and then
//! re-encodes it, rejecting any input whose bytes are not exactly the
//! canonical encoding. That single check subsumes reordered fields,
//! non-shortest integers, and indefinite-length containers, and it is what
//! makes `encode(decode(x)) = x` hold byte-for-byte.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::entry::StorageEntry;
use crate::validate;

/// One replicated write on the wire. Field order here **is** the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationEvent {
    pub key: String,
    pub node_id: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub tombstone: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ReplicationEvent {
    /// Check the same invariants the storage layer enforces, surfacing
    /// codec-flavored errors: shape problems are schema violations, size
    /// problems keep their payload-too-large kind.
    fn validate_wire(&self) -> Result<()> {
        self.as_entry().validate().map_err(|e| match e {
            Error::InvalidRequest { message } => Error::schema_violation(message),
            other => other,
        })
    }

    fn as_entry(&self) -> StorageEntry {
        StorageEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            timestamp_ms: self.timestamp_ms,
            node_id: self.node_id.clone(),
            seq: self.seq,
            tombstone: self.tombstone,
        }
    }
}

impl From<StorageEntry> for ReplicationEvent {
    fn from(entry: StorageEntry) -> Self {
        Self {
            key: entry.key,
            node_id: entry.node_id,
            seq: entry.seq,
            timestamp_ms: entry.timestamp_ms,
            tombstone: entry.tombstone,
            value: entry.value,
        }
    }
}

impl From<ReplicationEvent> for StorageEntry {
    fn from(event: ReplicationEvent) -> Self {
        Self {
            key: event.key,
            value: event.value,
            timestamp_ms: event.timestamp_ms,
            node_id: event.node_id,
            seq: event.seq,
            tombstone: event.tombstone,
        }
    }
}

/// Encode an event into its canonical byte string.
///
/// Rejects invariant-violating events before serialization and enforces the
/// encoded-size ceiling on the result.
pub fn encode(event: &ReplicationEvent) -> Result<Vec<u8>> {
    event
        .as_entry()
        .validate()?;
    let bytes = serde_cbor::to_vec(event)
        .map_err(|e| Error::internal(format!("event serialization failed: {}", e)))?;
    validate::validate_event_size(bytes.len())?;
    Ok(bytes)
}

/// Decode and fully re-validate an event from wire bytes.
pub fn decode(bytes: &[u8]) -> Result<ReplicationEvent> {
    validate::validate_event_size(bytes.len())?;

    let event: ReplicationEvent = serde_cbor::from_slice(bytes).map_err(|e| {
        use serde_cbor::error::Category;
        match e.classify() {
            Category::Syntax | Category::Eof => {
                Error::malformed(format!("undecodable event payload: {}", e))
            }
            Category::Data => {
                Error::schema_violation(format!("event schema mismatch: {}", e))
            }
            Category::Io => Error::internal(format!("event read failed: {}", e)),
        }
    })?;

    event.validate_wire()?;

    // Canonical-form check: anything but the exact bytes we would emit
    // (field order, shortest integers, definite lengths) is rejected.
    let reencoded = serde_cbor::to_vec(&event)
        .map_err(|e| Error::internal(format!("event re-serialization failed: {}", e)))?;
    if reencoded != bytes {
        return Err(Error::schema_violation(
            "event encoding is not in canonical form",
        ));
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> ReplicationEvent {
        ReplicationEvent {
            key: "user:123".to_string(),
            node_id: "device-xyz".to_string(),
            seq: 42,
            timestamp_ms: 1_637_142_400_000,
            tombstone: false,
            value: Some("john_doe".to_string()),
        }
    }

    // Minimal CBOR writers for crafting malformed inputs by hand.
    fn cbor_text(out: &mut Vec<u8>, s: &str) {
        assert!(s.len() < 24);
        out.push(0x60 + s.len() as u8);
        out.extend_from_slice(s.as_bytes());
    }
    fn cbor_uint_small(out: &mut Vec<u8>, n: u8) {
        assert!(n < 24);
        out.push(n);
    }

    #[test]
    fn encode_is_deterministic() {
        let event = sample_event();
        let first = encode(&event).unwrap();
        let second = encode(&event).unwrap();
        assert_eq!(first, second);
        // Six fields for a live event, five for a tombstone.
        assert_eq!(first[0], 0xA6);

        let tomb = ReplicationEvent {
            tombstone: true,
            value: None,
            ..sample_event()
        };
        assert_eq!(encode(&tomb).unwrap()[0], 0xA5);
    }

    #[test]
    fn round_trip_is_byte_exact() {
        for event in [
            sample_event(),
            ReplicationEvent {
                tombstone: true,
                value: None,
                ..sample_event()
            },
            ReplicationEvent {
                key: "k".into(),
                node_id: "n".into(),
                seq: 0,
                timestamp_ms: 0,
                tombstone: false,
                value: Some(String::new()),
            },
        ] {
            let bytes = encode(&event).unwrap();
            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded, event);
            assert_eq!(encode(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decode(b"\x00\x01\x02not-cbor-map").unwrap_err();
        // A leading 0x00 decodes as integer 0, which is a type mismatch for
        // the expected map; truly undecodable bytes classify as malformed.
        assert!(matches!(
            err,
            Error::Malformed { .. } | Error::SchemaViolation { .. }
        ));

        let truncated = &encode(&sample_event()).unwrap()[..10];
        assert!(matches!(decode(truncated), Err(Error::Malformed { .. })));
    }

    #[test]
    fn missing_field_is_schema_violation() {
        // Map of four entries: tombstone and value both absent.
        let mut bytes = vec![0xA4];
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "seq");
        cbor_uint_small(&mut bytes, 1);
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn extra_field_is_schema_violation() {
        let mut bytes = vec![0xA6];
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "seq");
        cbor_uint_small(&mut bytes, 1);
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        cbor_text(&mut bytes, "tombstone");
        bytes.push(0xF5); // true
        cbor_text(&mut bytes, "extra");
        cbor_uint_small(&mut bytes, 7);
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn type_mismatch_is_schema_violation() {
        let mut bytes = vec![0xA5];
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "seq");
        cbor_text(&mut bytes, "one"); // text where an integer belongs
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        cbor_text(&mut bytes, "tombstone");
        bytes.push(0xF5);
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn reordered_fields_rejected() {
        // node_id before key: decodes fine, fails the canonical-form check.
        let mut bytes = vec![0xA5];
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "seq");
        cbor_uint_small(&mut bytes, 1);
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        cbor_text(&mut bytes, "tombstone");
        bytes.push(0xF5);
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn non_shortest_integer_rejected() {
        // seq = 1 encoded as a one-byte-argument uint (0x18 0x01) instead of 0x01.
        let mut bytes = vec![0xA5];
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "seq");
        bytes.extend_from_slice(&[0x18, 0x01]);
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        cbor_text(&mut bytes, "tombstone");
        bytes.push(0xF5);
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn tombstone_with_value_rejected() {
        let mut bytes = vec![0xA6];
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "seq");
        cbor_uint_small(&mut bytes, 1);
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        cbor_text(&mut bytes, "tombstone");
        bytes.push(0xF5);
        cbor_text(&mut bytes, "value");
        cbor_text(&mut bytes, "v");
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn live_event_without_value_rejected() {
        let mut bytes = vec![0xA5];
        cbor_text(&mut bytes, "key");
        cbor_text(&mut bytes, "k");
        cbor_text(&mut bytes, "node_id");
        cbor_text(&mut bytes, "n");
        cbor_text(&mut bytes, "seq");
        cbor_uint_small(&mut bytes, 1);
        cbor_text(&mut bytes, "timestamp_ms");
        cbor_uint_small(&mut bytes, 2);
        cbor_text(&mut bytes, "tombstone");
        bytes.push(0xF4); // false
        assert!(matches!(decode(&bytes), Err(Error::SchemaViolation { .. })));
    }

    #[test]
    fn oversized_inputs_rejected() {
        // A maximum-size value still fits under the event ceiling.
        let event = ReplicationEvent {
            key: "big".into(),
            node_id: "n".into(),
            seq: 1,
            timestamp_ms: 1,
            tombstone: false,
            value: Some("x".repeat(validate::MAX_VALUE_BYTES)),
        };
        let bytes = encode(&event).unwrap();
        assert!(bytes.len() <= validate::MAX_EVENT_BYTES);

        // An over-cap value is rejected before serialization.
        let mut too_big = event.clone();
        too_big.value = Some("x".repeat(validate::MAX_VALUE_BYTES + 1));
        assert!(matches!(encode(&too_big), Err(Error::PayloadTooLarge { .. })));

        // Decode checks the raw length before touching the parser.
        let blob = vec![0u8; validate::MAX_EVENT_BYTES + 1];
        assert!(matches!(decode(&blob), Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn encoder_rejects_invalid_events() {
        let mut event = sample_event();
        event.key = String::new();
        assert!(matches!(encode(&event), Err(Error::InvalidRequest { .. })));

        let mut event = sample_event();
        event.tombstone = true; // still carries a value
        assert!(matches!(encode(&event), Err(Error::InvalidRequest { .. })));
    }
}
