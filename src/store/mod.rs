//! Storage layer: the versioned entry type, LWW engine, dedup windows, and
//! the digest used by anti-entropy.

pub mod dedup;
pub mod engine;
pub mod entry;
pub mod merkle;

pub use engine::{ApplyOutcome, LwwEngine};
pub use entry::{LwwDecision, StorageEntry};
pub use merkle::StateDigest;
