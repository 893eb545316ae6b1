//! # Client Facade
//!
//! Public entry point for one replica: owns the storage engine, clock,
//! command engine, MQTT adapter, replication pipeline, and anti-entropy
//! loop, and wires them together with one-way ownership. The command engine
//! talks to the transport only through an injected channel, and the adapter
//! reports inbound traffic through another; neither holds a reference back.
//!
//! Public operations generate a UUID v4 request id when the caller does not
//! supply one, execute through the command engine, and map wire responses
//! back into typed results. Connection-state transitions are re-broadcast on
//! a watch channel so applications can observe the transport without
//! touching it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::anti_entropy::{self, AntiEntropy};
use crate::clock::LocalClock;
use crate::command::{Command, CommandEngine, OutboundEvent, Response};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, NoopSink};
use crate::mqtt::{ConnectionState, InboundMessage, MqttAdapter};
use crate::replication::{spawn_outbound_worker, InboundApplier};
use crate::store::LwwEngine;
use crate::topics::{TopicAuthorizer, TopicKind, TopicScheme};

/// Matches responses arriving on the own response topic to waiting callers
/// by request id.
#[derive(Default)]
pub struct Correlator {
    waiters: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the response for `id`.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id.to_string(), tx);
        rx
    }

    /// Deliver a response to its waiter, if any. Uncorrelated responses are
    /// dropped (the waiter may have timed out already).
    pub fn complete(&self, response: Response) {
        if let Some(waiter) = self.waiters.lock().unwrap().remove(&response.id) {
            let _ = waiter.send(response);
        }
    }

    /// Abandon the waiter for `id` after a deadline expiry.
    pub fn forget(&self, id: &str) {
        self.waiters.lock().unwrap().remove(id);
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

/// One replica's public handle.
pub struct Client {
    config: Config,
    scheme: TopicScheme,
    store: Arc<LwwEngine>,
    engine: Arc<CommandEngine>,
    adapter: Arc<MqttAdapter>,
    state_rx: watch::Receiver<ConnectionState>,
    correlator: Arc<Correlator>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Start a replica with the default (no-op) metrics sink.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with_metrics(config, Arc::new(NoopSink)).await
    }

    /// Start a replica: open storage, seed the clock, connect the adapter,
    /// and spawn the pipeline and anti-entropy tasks.
    pub async fn start_with_metrics(
        config: Config,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(if config.persistence_enabled {
            LwwEngine::persistent(&config.storage_path, config.tombstone_retention_ms)?
        } else {
            LwwEngine::in_memory(config.tombstone_retention_ms)
        });
        let clock = Arc::new(LocalClock::new(config.node_id.clone()));
        if let Some(high_water) = store.high_water(&config.node_id) {
            // Resume strictly above anything this node already wrote.
            clock.advance_seq_to(high_water);
        }

        let scheme = TopicScheme::new(config.topic_prefix.clone(), config.client_id.clone());
        let authorizer = Arc::new(TopicAuthorizer::new(
            scheme.clone(),
            &config.replication,
            metrics.clone(),
        ));

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(256);
        let (adapter, state_rx) =
            MqttAdapter::start(&config, authorizer, inbound_tx, clock.now_ms())?;
        let adapter = Arc::new(adapter);

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundEvent>(256);
        let engine = Arc::new(CommandEngine::new(
            store.clone(),
            clock.clone(),
            outbound_tx.clone(),
            Duration::from_millis(config.command_timeout_ms),
            Duration::from_millis(config.idempotency_ttl_ms),
        ));

        // Replication egress. A client without the publish permission keeps
        // its writes local instead of failing every command.
        let can_publish = config.replication.can_publish_events;
        let events_topic = scheme.replication_events_topic();
        let publish_adapter = adapter.clone();
        let publish_metrics = metrics.clone();
        let outbound_worker = spawn_outbound_worker(
            outbound_rx,
            move |bytes| {
                let adapter = publish_adapter.clone();
                let topic = events_topic.clone();
                let metrics = publish_metrics.clone();
                async move {
                    if !can_publish {
                        metrics.increment("replication.publish_skipped");
                        debug!("replication publish not permitted; keeping write local");
                        return Ok(());
                    }
                    adapter.publish(&topic, bytes).await
                }
            },
            metrics.clone(),
        );

        let applier = Arc::new(InboundApplier::new(
            store.clone(),
            config.node_id.clone(),
            metrics.clone(),
        ));
        let sync_engine = Arc::new(AntiEntropy::new(
            store.clone(),
            config.node_id.clone(),
            outbound_tx,
            metrics.clone(),
        ));

        let digest_topic = scheme.replication_digest_topic();
        let digest_adapter = adapter.clone();
        let sync_task = anti_entropy::spawn_loop(
            sync_engine.clone(),
            clock.clone(),
            Duration::from_millis(config.anti_entropy_interval_ms),
            move |bytes| {
                let adapter = digest_adapter.clone();
                let topic = digest_topic.clone();
                async move {
                    if !can_publish {
                        return Ok(());
                    }
                    adapter.publish(&topic, bytes).await
                }
            },
        );

        let correlator = Arc::new(Correlator::new());
        let dispatch_task = tokio::spawn(dispatch_inbound(
            inbound_rx,
            scheme.clone(),
            applier,
            sync_engine,
            engine.clone(),
            adapter.clone(),
            correlator.clone(),
        ));

        info!(
            "replica '{}' started as client '{}'",
            config.node_id, config.client_id
        );

        Ok(Self {
            config,
            scheme,
            store,
            engine,
            adapter,
            state_rx,
            correlator,
            tasks: vec![outbound_worker, sync_task, dispatch_task],
        })
    }

    /// Observe connection-state transitions.
    pub fn connection_states(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Current transport state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Entries resident in local storage (tombstones included).
    pub fn entry_count(&self) -> usize {
        self.store.len()
    }

    /// Fetch a value. Absent and deleted keys read as `None`.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self.engine.execute(Command::get(request_id(), key)).await;
        if response.error_code == Some(102) {
            return Ok(None);
        }
        let response = into_result(response)?;
        match response.value {
            Some(serde_json::Value::String(value)) => Ok(Some(value)),
            _ => Err(Error::internal("GET response carried no string value")),
        }
    }

    /// Store a value.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        into_result(
            self.engine
                .execute(Command::set(request_id(), key, value))
                .await,
        )
        .map(|_| ())
    }

    /// Delete a key. OK whether or not it existed.
    pub async fn delete(&self, key: &str) -> Result<()> {
        into_result(self.engine.execute(Command::delete(request_id(), key)).await).map(|_| ())
    }

    /// Increment an integer value, creating it from zero when absent.
    pub async fn incr(&self, key: &str, amount: Option<i64>) -> Result<i64> {
        let response = into_result(
            self.engine
                .execute(Command::incr(request_id(), key, amount))
                .await,
        )?;
        int_value(&response)
    }

    /// Decrement an integer value.
    pub async fn decr(&self, key: &str, amount: Option<i64>) -> Result<i64> {
        let response = into_result(
            self.engine
                .execute(Command::decr(request_id(), key, amount))
                .await,
        )?;
        int_value(&response)
    }

    /// Append to a string value, creating the key when absent.
    pub async fn append(&self, key: &str, value: &str) -> Result<()> {
        into_result(
            self.engine
                .execute(Command::append(request_id(), key, value))
                .await,
        )
        .map(|_| ())
    }

    /// Prepend to a string value, creating the key when absent.
    pub async fn prepend(&self, key: &str, value: &str) -> Result<()> {
        into_result(
            self.engine
                .execute(Command::prepend(request_id(), key, value))
                .await,
        )
        .map(|_| ())
    }

    /// Fetch many keys; the result maps only the keys that were found.
    pub async fn mget(&self, keys: Vec<String>) -> Result<BTreeMap<String, String>> {
        let response = into_result(self.engine.execute(Command::mget(request_id(), keys)).await)?;
        response
            .results
            .ok_or_else(|| Error::internal("MGET response carried no results"))
    }

    /// Store many pairs, applied atomically on the local replica.
    pub async fn mset(&self, pairs: BTreeMap<String, String>) -> Result<()> {
        into_result(self.engine.execute(Command::mset(request_id(), pairs)).await).map(|_| ())
    }

    /// Issue a command to a peer's command topic and await the correlated
    /// response on our own response topic.
    ///
    /// The topic authorizer applies as usual, so with the default rules this
    /// only ever reaches our own command topic (loopback); foreign topics
    /// surface an authorization error.
    pub async fn send_command_to(
        &self,
        peer_client_id: &str,
        mut command: Command,
    ) -> Result<Response> {
        if command.id.is_empty() {
            command.id = request_id();
        }
        let topic = self.scheme.command_topic_for(peer_client_id);
        let payload = serde_json::to_vec(&command)
            .map_err(|e| Error::internal(format!("command encoding failed: {}", e)))?;

        let waiter = self.correlator.register(&command.id);
        if let Err(e) = self.adapter.publish(&topic, payload).await {
            self.correlator.forget(&command.id);
            return Err(e);
        }

        let deadline = Duration::from_millis(self.config.command_timeout_ms);
        match tokio::time::timeout(deadline, waiter).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.correlator.forget(&command.id);
                Err(Error::internal("correlator dropped the waiter"))
            }
            Err(_) => {
                self.correlator.forget(&command.id);
                Err(Error::timeout(format!(
                    "no response from '{}' within {} ms",
                    peer_client_id, self.config.command_timeout_ms
                )))
            }
        }
    }

    /// Graceful shutdown: stop the anti-entropy and pipeline tasks, leave
    /// the broker without triggering the Last Will, and flush storage.
    pub async fn shutdown(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.adapter.disconnect().await {
            warn!("graceful disconnect failed: {}", e);
        }
        self.store.persist()?;
        info!("replica '{}' stopped", self.config.node_id);
        Ok(())
    }
}

/// Route raw inbound messages to their consumers.
async fn dispatch_inbound(
    mut inbound: mpsc::Receiver<InboundMessage>,
    scheme: TopicScheme,
    applier: Arc<InboundApplier>,
    sync_engine: Arc<AntiEntropy>,
    engine: Arc<CommandEngine>,
    adapter: Arc<MqttAdapter>,
    correlator: Arc<Correlator>,
) {
    while let Some(message) = inbound.recv().await {
        match scheme.parse(&message.topic) {
            Some(TopicKind::ReplicationEvents) => {
                applier.handle_payload(&message.payload);
            }
            Some(TopicKind::ReplicationDigest) => {
                sync_engine.handle_peer_digest(&message.payload).await;
            }
            Some(TopicKind::Command { client_id }) if client_id == scheme.client_id() => {
                if let Some(response) = engine.execute_raw(&message.payload).await {
                    match serde_json::to_vec(&response) {
                        Ok(payload) => {
                            let topic = scheme.response_topic();
                            if let Err(e) = adapter.publish(&topic, payload).await {
                                warn!("response publish failed: {}", e);
                            }
                        }
                        Err(e) => warn!("response encoding failed: {}", e),
                    }
                }
            }
            Some(TopicKind::Response { client_id }) if client_id == scheme.client_id() => {
                match serde_json::from_slice::<Response>(&message.payload) {
                    Ok(response) => correlator.complete(response),
                    // The LWT body also lands here; it is not a response.
                    Err(e) => debug!("ignoring non-response payload on res topic: {}", e),
                }
            }
            _ => warn!("ignoring message on unexpected topic '{}'", message.topic),
        }
    }
    debug!("inbound dispatch stopped");
}

fn request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Map a wire response back into a typed result.
fn into_result(response: Response) -> Result<Response> {
    if response.is_ok() {
        return Ok(response);
    }
    let message = response
        .error
        .clone()
        .unwrap_or_else(|| "unspecified error".to_string());
    Err(match response.error_code {
        Some(100) => Error::InvalidRequest { message },
        Some(101) => Error::PayloadTooLarge { message },
        Some(102) => Error::NotFound { key: message },
        Some(103) => Error::InvalidType { key: message },
        Some(104) => Error::RangeOverflow { key: message },
        Some(105) => Error::Timeout { message },
        Some(106) => Error::Disconnected { message },
        Some(107) => Error::Malformed { message },
        Some(108) => Error::SchemaViolation { message },
        Some(109) => Error::Unauthorized {
            topic: String::new(),
            message,
        },
        _ => Error::Internal { message },
    })
}

fn int_value(response: &Response) -> Result<i64> {
    response
        .value
        .as_ref()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::internal("numeric response carried no integer value"))
}
