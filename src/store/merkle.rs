//! # Replica Digest
//!
//! Compact Merkle-style summary of a replica's state, used by the
//! anti-entropy loop. Leaves are SHA-256 hashes over each entry's key and
//! its `(timestamp_ms, node_id, seq)` triple; values never enter the digest,
//! since the triple already names the winning write.
//!
//! Keys are partitioned into a fixed number of buckets by key hash, leaf
//! hashes are folded in sorted key order inside each bucket, and the root
//! hashes the concatenated bucket hashes. Two replicas with equal state
//! always produce identical digests (everything is sorted, nothing depends
//! on map iteration order), and a divergent key shows up as exactly one
//! differing bucket on both sides.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::entry::StorageEntry;

/// Number of digest buckets. Fixed across the fleet: both sides of a digest
/// comparison must agree on the partitioning.
pub const DIGEST_BUCKETS: usize = 16;

/// Digest of one replica's full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDigest {
    /// Root hash over all bucket hashes, hex-encoded.
    pub root: String,
    /// Per-bucket hashes, hex-encoded, `DIGEST_BUCKETS` of them.
    pub buckets: Vec<String>,
}

impl StateDigest {
    /// Build the digest for a snapshot of entries. Order of the input slice
    /// does not matter; the digest is computed over sorted keys.
    pub fn compute(entries: &[StorageEntry]) -> Self {
        let mut sorted: Vec<&StorageEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));

        let mut buckets: Vec<Sha256> = (0..DIGEST_BUCKETS).map(|_| Sha256::new()).collect();
        for entry in sorted {
            let leaf = leaf_hash(entry);
            buckets[bucket_of(&entry.key)].update(leaf);
        }

        let mut bucket_hex = Vec::with_capacity(DIGEST_BUCKETS);
        let mut root = Sha256::new();
        for hasher in buckets {
            let digest = hasher.finalize();
            root.update(digest);
            bucket_hex.push(to_hex(&digest));
        }

        Self {
            root: to_hex(&root.finalize()),
            buckets: bucket_hex,
        }
    }

    /// Bucket indices where `self` and `other` disagree. Empty when the
    /// replicas have converged.
    pub fn divergent_buckets(&self, other: &StateDigest) -> Vec<usize> {
        self.buckets
            .iter()
            .zip(other.buckets.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether both digests describe identical state.
    pub fn matches(&self, other: &StateDigest) -> bool {
        self.root == other.root
    }
}

/// Bucket index for a key, stable across replicas.
pub fn bucket_of(key: &str) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    digest[0] as usize % DIGEST_BUCKETS
}

fn leaf_hash(entry: &StorageEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.key.as_bytes());
    hasher.update([0u8]);
    hasher.update(entry.timestamp_ms.to_be_bytes());
    hasher.update(entry.node_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(entry.seq.to_be_bytes());
    hasher.update([entry.tombstone as u8]);
    hasher.finalize().into()
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, ts: u64, node: &str, seq: u64) -> StorageEntry {
        StorageEntry::live(key, "v", ts, node, seq)
    }

    #[test]
    fn equal_state_equal_digest_regardless_of_order() {
        let a = vec![entry("x", 1, "na", 1), entry("y", 2, "nb", 1)];
        let b = vec![entry("y", 2, "nb", 1), entry("x", 1, "na", 1)];
        let da = StateDigest::compute(&a);
        let db = StateDigest::compute(&b);
        assert!(da.matches(&db));
        assert_eq!(da, db);
        assert!(da.divergent_buckets(&db).is_empty());
    }

    #[test]
    fn value_does_not_enter_the_digest() {
        // The triple names the write; equal triples digest equally.
        let mut a = entry("x", 1, "na", 1);
        a.value = Some("one".into());
        let mut b = entry("x", 1, "na", 1);
        b.value = Some("two".into());
        assert!(StateDigest::compute(&[a]).matches(&StateDigest::compute(&[b])));
    }

    #[test]
    fn divergence_localizes_to_the_keys_bucket() {
        let base = vec![entry("x", 1, "na", 1), entry("y", 2, "nb", 1)];
        let mut changed = base.clone();
        changed[0].timestamp_ms = 9;
        let da = StateDigest::compute(&base);
        let db = StateDigest::compute(&changed);
        assert!(!da.matches(&db));
        let divergent = da.divergent_buckets(&db);
        assert_eq!(divergent, vec![bucket_of("x")]);
    }

    #[test]
    fn tombstones_change_the_digest() {
        let live = vec![entry("x", 1, "na", 1)];
        let mut dead = live.clone();
        dead[0].tombstone = true;
        dead[0].value = None;
        assert!(!StateDigest::compute(&live).matches(&StateDigest::compute(&dead)));
    }

    #[test]
    fn empty_state_has_a_stable_digest() {
        let a = StateDigest::compute(&[]);
        let b = StateDigest::compute(&[]);
        assert_eq!(a, b);
        assert_eq!(a.buckets.len(), DIGEST_BUCKETS);
    }
}
