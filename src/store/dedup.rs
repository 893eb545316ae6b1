//! Per-node deduplication windows.
//!
//! `(node_id, seq)` uniquely identifies a write, and QoS-1 transport is
//! at-least-once, so every replica must drop redelivered writes before the
//! LWW resolver sees them. Keeping every seen seq forever would grow without
//! bound; instead each origin node gets a compact window: a high-water mark
//! plus the set of seqs observed inside a fixed out-of-order horizon below
//! it. Anything at or below `hwm - window` is treated as already seen.

use std::collections::{BTreeSet, HashMap};

/// How far below the high-water mark out-of-order seqs are still tracked.
pub const DEFAULT_DEDUP_WINDOW: u64 = 1024;

/// Dedup state for a single origin node.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    high_water: Option<u64>,
    recent: BTreeSet<u64>,
    window: u64,
}

impl DedupWindow {
    pub fn new(window: u64) -> Self {
        Self {
            high_water: None,
            recent: BTreeSet::new(),
            window: window.max(1),
        }
    }

    /// Record a seq. Returns `true` when it was fresh, `false` on a repeat.
    ///
    /// Seqs older than the tracking horizon are conservatively reported as
    /// repeats: at that distance a redelivery is far more likely than a
    /// months-late first delivery, and dropping keeps the window compact.
    pub fn observe(&mut self, seq: u64) -> bool {
        if let Some(hwm) = self.high_water {
            if seq <= hwm.saturating_sub(self.window) {
                return false;
            }
            if !self.recent.insert(seq) {
                return false;
            }
            if seq > hwm {
                self.high_water = Some(seq);
            }
        } else {
            self.recent.insert(seq);
            self.high_water = Some(seq);
        }
        self.prune();
        true
    }

    /// Whether `seq` is still inside the tracked horizon. Tombstone GC keeps
    /// tombstones whose seq the window still accounts for.
    pub fn tracks(&self, seq: u64) -> bool {
        match self.high_water {
            Some(hwm) => seq > hwm.saturating_sub(self.window),
            None => false,
        }
    }

    /// Highest seq observed from this node.
    pub fn high_water(&self) -> Option<u64> {
        self.high_water
    }

    fn prune(&mut self) {
        if let Some(hwm) = self.high_water {
            let floor = hwm.saturating_sub(self.window);
            self.recent = self.recent.split_off(&(floor + 1));
        }
    }
}

/// Dedup windows for every origin node seen by this replica.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    windows: HashMap<String, DedupWindow>,
    window_size: u64,
}

impl DedupRegistry {
    pub fn new(window_size: u64) -> Self {
        Self {
            windows: HashMap::new(),
            window_size: window_size.max(1),
        }
    }

    /// Record `(node_id, seq)`; `true` when fresh.
    pub fn observe(&mut self, node_id: &str, seq: u64) -> bool {
        self.windows
            .entry(node_id.to_string())
            .or_insert_with(|| DedupWindow::new(self.window_size))
            .observe(seq)
    }

    /// Whether the window for `node_id` still tracks `seq`.
    pub fn requires(&self, node_id: &str, seq: u64) -> bool {
        self.windows.get(node_id).map(|w| w.tracks(seq)).unwrap_or(false)
    }

    /// High-water mark for `node_id`, if any write from it was seen.
    pub fn high_water(&self, node_id: &str) -> Option<u64> {
        self.windows.get(node_id).and_then(|w| w.high_water())
    }
}
