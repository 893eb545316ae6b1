//! # LWW Storage Engine
//!
//! In-memory key → entry map guarded by an `RwLock`, with per-node dedup
//! windows, tombstone retention, and optional sled-backed persistence.
//!
//! All writes funnel through [`LwwEngine::put`], which applies the rule in
//! one short critical section: dedup first (a repeated `(node_id, seq)` never
//! reaches the resolver), then the strict `(timestamp_ms, node_id, seq)`
//! comparison against the resident entry. Readers take the shared lock and
//! clone, so reads are snapshot-consistent and never block each other.
//!
//! When persistence is enabled every applied write is mirrored into a sled
//! tree keyed by the entry key; a restart reloads the identical LWW-resolved
//! map and reseeds the dedup high-water marks.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::store::dedup::{DedupRegistry, DEFAULT_DEDUP_WINDOW};
use crate::store::entry::{LwwDecision, StorageEntry};

/// What happened to a candidate entry handed to [`LwwEngine::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The candidate won and is now resident.
    Applied,
    /// A resident entry with a greater-or-equal triple already covers it.
    ObsoleteByLww,
    /// The `(node_id, seq)` pair was already observed; dropped before LWW.
    Duplicate,
}

/// Storage engine owning all entries for one replica.
pub struct LwwEngine {
    data: RwLock<HashMap<String, StorageEntry>>,
    dedup: Mutex<DedupRegistry>,
    tombstone_retention_ms: u64,
    persist: Option<PersistentTree>,
}

struct PersistentTree {
    _db: sled::Db,
    tree: sled::Tree,
}

impl LwwEngine {
    /// Open a RAM-only engine.
    pub fn in_memory(tombstone_retention_ms: u64) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            dedup: Mutex::new(DedupRegistry::new(DEFAULT_DEDUP_WINDOW)),
            tombstone_retention_ms,
            persist: None,
        }
    }

    /// Open a persistent engine rooted at `path`, reloading any prior state.
    ///
    /// The reload rebuilds the in-memory map from the sled tree and reseeds
    /// every origin node's dedup high-water mark, so redeliveries of already
    /// persisted writes are still dropped after a restart.
    pub fn persistent(path: &str, tombstone_retention_ms: u64) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| Error::internal(format!("failed to open storage at {}: {}", path, e)))?;
        let tree = db
            .open_tree(b"entries")
            .map_err(|e| Error::internal(format!("failed to open entry tree: {}", e)))?;

        let mut data = HashMap::new();
        let mut dedup = DedupRegistry::new(DEFAULT_DEDUP_WINDOW);
        for item in tree.iter() {
            let (_, raw) = item
                .map_err(|e| Error::internal(format!("storage iteration failed: {}", e)))?;
            let entry: StorageEntry = bincode::deserialize(&raw)
                .map_err(|e| Error::internal(format!("corrupt persisted entry: {}", e)))?;
            dedup.observe(&entry.node_id, entry.seq);
            data.insert(entry.key.clone(), entry);
        }
        debug!("reloaded {} entries from {}", data.len(), path);

        Ok(Self {
            data: RwLock::new(data),
            dedup: Mutex::new(dedup),
            tombstone_retention_ms,
            persist: Some(PersistentTree { _db: db, tree }),
        })
    }

    /// Look up the resident entry for `key`, tombstones included.
    pub fn get(&self, key: &str) -> Option<StorageEntry> {
        let data = self.data.read().unwrap();
        data.get(key).cloned()
    }

    /// Look up a live value, treating tombstones as absent.
    pub fn get_value(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap();
        data.get(key).and_then(|e| {
            if e.tombstone {
                None
            } else {
                e.value.clone()
            }
        })
    }

    /// Apply one candidate entry: dedup, then LWW against the resident.
    pub fn put(&self, entry: StorageEntry) -> Result<ApplyOutcome> {
        entry.validate()?;
        let mut batch = self.put_batch(vec![entry])?;
        Ok(batch.pop().expect("one outcome per entry"))
    }

    /// Apply several entries atomically under one write lock. Used by MSET:
    /// either every entry is examined and applied in order, or none are
    /// (validation happens before the lock is taken).
    pub fn put_many(&self, entries: Vec<StorageEntry>) -> Result<Vec<ApplyOutcome>> {
        for entry in &entries {
            entry.validate()?;
        }
        self.put_batch(entries)
    }

    fn put_batch(&self, entries: Vec<StorageEntry>) -> Result<Vec<ApplyOutcome>> {
        let mut outcomes = Vec::with_capacity(entries.len());
        let mut data = self.data.write().unwrap();
        let mut dedup = self.dedup.lock().unwrap();
        for entry in entries {
            if !dedup.observe(&entry.node_id, entry.seq) {
                outcomes.push(ApplyOutcome::Duplicate);
                continue;
            }
            let decision = match data.get(&entry.key) {
                Some(resident) => entry.lww_against(resident),
                None => LwwDecision::CandidateWins,
            };
            match decision {
                LwwDecision::CandidateWins => {
                    self.persist_entry(&entry);
                    data.insert(entry.key.clone(), entry);
                    outcomes.push(ApplyOutcome::Applied);
                }
                LwwDecision::ResidentWins => outcomes.push(ApplyOutcome::ObsoleteByLww),
                // Same triple from a node we had no window state for
                // (e.g. right after a restart without persistence).
                LwwDecision::Duplicate => outcomes.push(ApplyOutcome::Duplicate),
            }
        }
        Ok(outcomes)
    }

    /// Delete `key` by writing a tombstone stamped by `stamp`. Idempotent:
    /// the tombstone is written whether or not the key exists, so it also
    /// suppresses older in-flight writes that have not arrived yet.
    pub fn delete(
        &self,
        key: &str,
        timestamp_ms: u64,
        node_id: &str,
        seq: u64,
    ) -> Result<StorageEntry> {
        let tombstone = StorageEntry::tombstone(key, timestamp_ms, node_id, seq);
        self.put(tombstone.clone())?;
        Ok(tombstone)
    }

    /// Snapshot every resident entry, tombstones included.
    pub fn scan_all(&self) -> Vec<StorageEntry> {
        let data = self.data.read().unwrap();
        data.values().cloned().collect()
    }

    /// Drop tombstones whose timestamp is older than the retention window
    /// and whose `(node_id, seq)` slot the dedup windows no longer track.
    /// Returns the number collected. Failures to unpersist are logged and
    /// never block writes.
    pub fn gc_tombstones(&self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.tombstone_retention_ms);
        let mut data = self.data.write().unwrap();
        let dedup = self.dedup.lock().unwrap();
        let doomed: Vec<String> = data
            .values()
            .filter(|e| {
                e.tombstone && e.timestamp_ms < cutoff && !dedup.requires(&e.node_id, e.seq)
            })
            .map(|e| e.key.clone())
            .collect();
        for key in &doomed {
            data.remove(key);
            if let Some(persist) = &self.persist {
                if let Err(e) = persist.tree.remove(key.as_bytes()) {
                    warn!("failed to unpersist tombstone '{}': {}", key, e);
                }
            }
        }
        doomed.len()
    }

    /// Number of resident entries, tombstones included.
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resident tombstones.
    pub fn tombstone_count(&self) -> usize {
        let data = self.data.read().unwrap();
        data.values().filter(|e| e.tombstone).count()
    }

    /// Highest seq observed from `node_id`, for clock seeding after reload.
    pub fn high_water(&self, node_id: &str) -> Option<u64> {
        self.dedup.lock().unwrap().high_water(node_id)
    }

    /// Flush pending persistence work to disk. No-op for RAM-only engines.
    pub fn persist(&self) -> Result<()> {
        if let Some(persist) = &self.persist {
            persist
                .tree
                .flush()
                .map_err(|e| Error::internal(format!("storage flush failed: {}", e)))?;
        }
        Ok(())
    }

    fn persist_entry(&self, entry: &StorageEntry) {
        if let Some(persist) = &self.persist {
            match bincode::serialize(entry) {
                Ok(raw) => {
                    if let Err(e) = persist.tree.insert(entry.key.as_bytes(), raw) {
                        warn!("failed to persist entry '{}': {}", entry.key, e);
                    }
                }
                Err(e) => warn!("failed to serialize entry '{}': {}", entry.key, e),
            }
        }
    }
}
