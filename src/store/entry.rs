//! Versioned storage record and the Last-Writer-Wins ordering rule.
//!
//! Every write in the system is a [`StorageEntry`]: a key, an optional value
//! (absent on tombstones), and the `(timestamp_ms, node_id, seq)` triple that
//! totally orders writes to the same key. The triple order is lexicographic,
//! which makes conflict resolution deterministic and independent of arrival
//! order: equal timestamps fall back to the larger `node_id` string, then the
//! larger `seq`. Full equality of the triple means the same write seen twice.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::validate;

/// The single versioned record owned by the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Key under mutation, 1..=256 UTF-8 bytes.
    pub key: String,
    /// Resulting value; `None` exactly when `tombstone` is true.
    pub value: Option<String>,
    /// Milliseconds since epoch at the writing replica.
    pub timestamp_ms: u64,
    /// Identity of the writing replica.
    pub node_id: String,
    /// Monotonic per-`node_id` counter; `(node_id, seq)` names a write.
    pub seq: u64,
    /// Deletion marker.
    pub tombstone: bool,
}

/// Outcome of comparing a candidate entry against the resident one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LwwDecision {
    /// Candidate strictly wins and replaces the resident entry.
    CandidateWins,
    /// Resident entry is newer or equal-and-different; candidate is dropped.
    ResidentWins,
    /// Identical triple: the same write observed again.
    Duplicate,
}

impl StorageEntry {
    /// Build a live (non-tombstone) entry.
    pub fn live(
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp_ms: u64,
        node_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp_ms,
            node_id: node_id.into(),
            seq,
            tombstone: false,
        }
    }

    /// Build a tombstone entry.
    pub fn tombstone(
        key: impl Into<String>,
        timestamp_ms: u64,
        node_id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp_ms,
            node_id: node_id.into(),
            seq,
            tombstone: true,
        }
    }

    /// The `(timestamp_ms, node_id, seq)` triple used for LWW ordering.
    pub fn lww_key(&self) -> (u64, &str, u64) {
        (self.timestamp_ms, &self.node_id, self.seq)
    }

    /// Decide whether `self` (the candidate) supersedes `resident`.
    ///
    /// Total, deterministic, commutative-by-triple: any permutation of the
    /// same multiset of entries converges to the same winner.
    pub fn lww_against(&self, resident: &StorageEntry) -> LwwDecision {
        use std::cmp::Ordering::*;
        match self.lww_key().cmp(&resident.lww_key()) {
            Greater => LwwDecision::CandidateWins,
            Less => LwwDecision::ResidentWins,
            Equal => LwwDecision::Duplicate,
        }
    }

    /// Check the record invariants: key and node_id limits, value cap, and the
    /// tombstone ⇔ value-absent equivalence.
    pub fn validate(&self) -> Result<()> {
        validate::validate_key(&self.key)?;
        validate::validate_node_id(&self.node_id)?;
        match (&self.value, self.tombstone) {
            (Some(value), false) => validate::validate_value(value),
            (None, true) => Ok(()),
            (Some(_), true) => Err(Error::invalid_request(
                "tombstone entry must not carry a value",
            )),
            (None, false) => Err(Error::invalid_request(
                "non-tombstone entry must carry a value",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lww_prefers_larger_timestamp() {
        let older = StorageEntry::live("k", "old", 100, "na", 5);
        let newer = StorageEntry::live("k", "new", 200, "na", 1);
        assert_eq!(newer.lww_against(&older), LwwDecision::CandidateWins);
        assert_eq!(older.lww_against(&newer), LwwDecision::ResidentWins);
    }

    #[test]
    fn lww_tie_breaks_by_node_id_then_seq() {
        // Scenario: equal timestamps, "nb" > "na" lexicographically.
        let a = StorageEntry::live("k", "A", 100, "na", 1);
        let b = StorageEntry::live("k", "B", 100, "nb", 1);
        assert_eq!(b.lww_against(&a), LwwDecision::CandidateWins);
        assert_eq!(a.lww_against(&b), LwwDecision::ResidentWins);

        // Same timestamp and node: larger seq wins.
        let s1 = StorageEntry::live("k", "one", 100, "na", 1);
        let s2 = StorageEntry::live("k", "two", 100, "na", 2);
        assert_eq!(s2.lww_against(&s1), LwwDecision::CandidateWins);
    }

    #[test]
    fn identical_triple_is_duplicate() {
        let a = StorageEntry::live("k", "v", 100, "na", 1);
        let b = a.clone();
        assert_eq!(b.lww_against(&a), LwwDecision::Duplicate);
    }

    #[test]
    fn lww_is_transitive() {
        let a = StorageEntry::live("k", "a", 300, "na", 1);
        let b = StorageEntry::live("k", "b", 200, "nz", 9);
        let c = StorageEntry::live("k", "c", 200, "na", 9);
        assert_eq!(a.lww_against(&b), LwwDecision::CandidateWins);
        assert_eq!(b.lww_against(&c), LwwDecision::CandidateWins);
        assert_eq!(a.lww_against(&c), LwwDecision::CandidateWins);
    }

    #[test]
    fn invariants_enforced() {
        assert!(StorageEntry::live("k", "v", 1, "n", 1).validate().is_ok());
        assert!(StorageEntry::tombstone("k", 1, "n", 1).validate().is_ok());

        let mut bad = StorageEntry::live("k", "v", 1, "n", 1);
        bad.tombstone = true;
        assert!(bad.validate().is_err());

        let mut bad = StorageEntry::tombstone("k", 1, "n", 1);
        bad.tombstone = false;
        assert!(bad.validate().is_err());

        assert!(StorageEntry::live("", "v", 1, "n", 1).validate().is_err());
        assert!(StorageEntry::live("k", "v", 1, "", 1).validate().is_err());
    }
}
