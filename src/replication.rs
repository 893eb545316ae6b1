//! # Replication Pipeline
//!
//! Connects the storage engine to the MQTT fabric in both directions.
//!
//! Outbound: every state-changing local write hands exactly one
//! [`OutboundEvent`] to the worker spawned here, which encodes it with the
//! deterministic codec and publishes it on the replication topic. The
//! result is acked back to the command engine, which is what gives commands
//! their definitive OK/`DISCONNECTED` outcome.
//!
//! Inbound: payloads from the replication topic are decoded, writes that
//! originated here are skipped (the broker echoes our own publishes back),
//! duplicates are dropped by the dedup window, and the rest go through LWW.
//! Applying an inbound event never emits an outbound one, so there are no
//! replication cycles. Decode failures are logged, counted, and dropped;
//! they never kill the loop.

use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::OutboundEvent;
use crate::error::Result;
use crate::event::{self, ReplicationEvent};
use crate::metrics::MetricsSink;
use crate::store::{ApplyOutcome, LwwEngine};

/// Applies inbound replication payloads to the local store.
pub struct InboundApplier {
    store: Arc<LwwEngine>,
    own_node_id: String,
    metrics: Arc<dyn MetricsSink>,
}

impl InboundApplier {
    pub fn new(
        store: Arc<LwwEngine>,
        own_node_id: impl Into<String>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            own_node_id: own_node_id.into(),
            metrics,
        }
    }

    /// Decode and apply one payload. Returns the apply outcome, or `None`
    /// when the payload was dropped (undecodable, or our own echo).
    pub fn handle_payload(&self, payload: &[u8]) -> Option<ApplyOutcome> {
        let event = match event::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.increment("replication.decode_error");
                warn!("dropping undecodable replication payload: {}", e);
                return None;
            }
        };
        self.apply(event)
    }

    /// Apply an already-decoded event. Applications are silent: no outbound
    /// event is produced in response.
    pub fn apply(&self, event: ReplicationEvent) -> Option<ApplyOutcome> {
        if event.node_id == self.own_node_id {
            self.metrics.increment("replication.self_skip");
            return None;
        }
        match self.store.put(event.into()) {
            Ok(outcome) => {
                match outcome {
                    ApplyOutcome::Applied => self.metrics.increment("replication.applied"),
                    ApplyOutcome::Duplicate => self.metrics.increment("replication.duplicate"),
                    ApplyOutcome::ObsoleteByLww => {
                        self.metrics.increment("replication.obsolete")
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                self.metrics.increment("replication.apply_error");
                warn!("dropping unapplicable replication event: {}", e);
                None
            }
        }
    }
}

/// Spawn the outbound worker: consume events from the command engine,
/// encode, publish through the injected callback, and ack the result.
///
/// The publish callback is injected (rather than the adapter itself) to keep
/// ownership one-way: the facade owns both ends and wires them together.
pub fn spawn_outbound_worker<F, Fut>(
    mut events: mpsc::Receiver<OutboundEvent>,
    publish: F,
    metrics: Arc<dyn MetricsSink>,
) -> JoinHandle<()>
where
    F: Fn(Vec<u8>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        while let Some(OutboundEvent { entry, ack }) = events.recv().await {
            let result = match event::encode(&ReplicationEvent::from(entry)) {
                Ok(bytes) => publish(bytes).await,
                Err(e) => Err(e),
            };
            match &result {
                Ok(()) => {
                    metrics.increment("replication.published");
                }
                Err(e) => {
                    metrics.increment("replication.publish_failed");
                    warn!("outbound replication publish failed: {}", e);
                }
            }
            // The command engine may have timed out and dropped its end.
            let _ = ack.send(result);
        }
        debug!("outbound replication worker stopped");
    })
}
