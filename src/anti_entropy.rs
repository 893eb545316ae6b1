//! # Anti-Entropy Loop
//!
//! Repairs silent divergence that real-time replication missed (dropped
//! messages, long partitions, restarts without persistence).
//!
//! Each replica periodically publishes a [`DigestMessage`] — the bucketed
//! Merkle summary of its state — on the digest topic, and consumes peer
//! digests from the same topic. A mismatched root narrows to the divergent
//! buckets, and the replica re-publishes every entry under those buckets as
//! ordinary replication events with their original `(timestamp_ms, node_id,
//! seq)` triples. Receivers dedup and LWW-apply them like any other event,
//! so a repair round is idempotent: at worst it changes nothing.
//!
//! Convergence is declared when an incoming digest matches the local root.
//! Partial failures log, count, and leave the replica unchanged; the next
//! interval retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::clock::LocalClock;
use crate::command::OutboundEvent;
use crate::metrics::MetricsSink;
use crate::store::merkle::{bucket_of, StateDigest, DIGEST_BUCKETS};
use crate::store::LwwEngine;

/// Jitter fraction applied to the digest interval.
const INTERVAL_JITTER: f64 = 0.2;

/// Digest message exchanged on the digest topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestMessage {
    /// Replica that produced the digest.
    pub node_id: String,
    /// Summary of its full state.
    pub digest: StateDigest,
}

/// Digest production and peer-digest handling for one replica.
pub struct AntiEntropy {
    store: Arc<LwwEngine>,
    node_id: String,
    outbound: mpsc::Sender<OutboundEvent>,
    metrics: Arc<dyn MetricsSink>,
}

impl AntiEntropy {
    pub fn new(
        store: Arc<LwwEngine>,
        node_id: impl Into<String>,
        outbound: mpsc::Sender<OutboundEvent>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            outbound,
            metrics,
        }
    }

    /// Digest of the local replica, ready to publish.
    pub fn local_digest(&self) -> DigestMessage {
        DigestMessage {
            node_id: self.node_id.clone(),
            digest: StateDigest::compute(&self.store.scan_all()),
        }
    }

    /// Encode the local digest for the wire.
    pub fn encode_local_digest(&self) -> Option<Vec<u8>> {
        match serde_cbor::to_vec(&self.local_digest()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("digest encoding failed: {}", e);
                None
            }
        }
    }

    /// Consume a peer digest payload: compare, and repair divergent buckets
    /// by re-publishing their entries. Undecodable payloads are dropped.
    pub async fn handle_peer_digest(&self, payload: &[u8]) {
        let message: DigestMessage = match serde_cbor::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.increment("anti_entropy.decode_error");
                warn!("dropping undecodable digest payload: {}", e);
                return;
            }
        };
        if message.node_id == self.node_id {
            return;
        }
        if message.digest.buckets.len() != DIGEST_BUCKETS {
            self.metrics.increment("anti_entropy.decode_error");
            warn!(
                "dropping digest from '{}' with {} buckets (expected {})",
                message.node_id,
                message.digest.buckets.len(),
                DIGEST_BUCKETS
            );
            return;
        }

        let local = self.local_digest();
        if local.digest.matches(&message.digest) {
            self.metrics.increment("anti_entropy.converged");
            debug!("converged with '{}'", message.node_id);
            return;
        }

        let divergent = local.digest.divergent_buckets(&message.digest);
        self.metrics.increment("anti_entropy.divergent");
        info!(
            "digest mismatch with '{}': repairing {} bucket(s)",
            message.node_id,
            divergent.len()
        );
        let repaired = self.repair_buckets(&divergent).await;
        debug!("re-published {} entr(ies) for repair", repaired);
    }

    /// Re-publish every resident entry under the given buckets as ordinary
    /// replication events, original triples preserved. Returns how many were
    /// handed to the outbound pipeline.
    pub async fn repair_buckets(&self, buckets: &[usize]) -> usize {
        let mut repaired = 0;
        for entry in self.store.scan_all() {
            if !buckets.contains(&bucket_of(&entry.key)) {
                continue;
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            if self
                .outbound
                .send(OutboundEvent {
                    entry,
                    ack: ack_tx,
                })
                .await
                .is_err()
            {
                warn!("outbound pipeline gone; abandoning repair round");
                return repaired;
            }
            match ack_rx.await {
                Ok(Ok(())) => {
                    repaired += 1;
                    self.metrics.increment("anti_entropy.repair_events");
                }
                Ok(Err(e)) => {
                    // Self-healing: the next interval retries what this
                    // round could not deliver.
                    warn!("repair publish failed: {}", e);
                }
                Err(_) => warn!("repair publish ack dropped"),
            }
        }
        repaired
    }
}

/// Interval with ±20 % jitter so replicas do not tick in lockstep.
pub fn jittered_interval(base: Duration) -> Duration {
    let jitter = 1.0 + INTERVAL_JITTER * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    Duration::from_secs_f64(base.as_secs_f64() * jitter)
}

/// Spawn the periodic loop: tombstone GC, then digest publish. The returned
/// handle is aborted on shutdown, before the storage layer is torn down.
pub fn spawn_loop<F, Fut>(
    engine: Arc<AntiEntropy>,
    clock: Arc<LocalClock>,
    interval: Duration,
    publish_digest: F,
) -> JoinHandle<()>
where
    F: Fn(Vec<u8>) -> Fut + Send + 'static,
    Fut: Future<Output = crate::error::Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(jittered_interval(interval)).await;

            let collected = engine.store.gc_tombstones(clock.now_ms());
            if collected > 0 {
                debug!("collected {} expired tombstone(s)", collected);
            }

            if let Some(bytes) = engine.encode_local_digest() {
                match publish_digest(bytes).await {
                    Ok(()) => engine.metrics.increment("anti_entropy.digest_published"),
                    Err(e) => {
                        engine.metrics.increment("anti_entropy.digest_failed");
                        warn!("digest publish failed: {}", e);
                    }
                }
            }
        }
    })
}
