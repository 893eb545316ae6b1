//! Replicated key-value core for mobile nodes.
//!
//! Each client owns a local authoritative replica, accepts local commands,
//! publishes change events over MQTT, ingests peer events, and converges via
//! periodic Merkle-digest anti-entropy. Conflicts resolve with per-key
//! Last-Writer-Wins over `(timestamp_ms, node_id, seq)` triples.

pub mod anti_entropy;
pub mod client;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod metrics;
pub mod mqtt;
pub mod replication;
pub mod store;
pub mod topics;
pub mod validate;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use event::ReplicationEvent;
pub use mqtt::ConnectionState;
pub use store::{ApplyOutcome, LwwEngine, StorageEntry};
