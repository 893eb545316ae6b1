//! # MQTT Transport Adapter
//!
//! Owns the broker session: connect options (keep-alive, credentials, TLS,
//! Last Will), the QoS-1 subscriptions, the connection state machine, the
//! reconnect backoff, and the bounded offline publish queue.
//!
//! ## Connection state machine
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnecting → Disconnected
//!                     ↑            │
//!                     └─ Reconnecting ←┘   (on failure, when auto-reconnect)
//! ```
//!
//! Failures from Connecting or Connected move to Reconnecting when
//! auto-reconnect is enabled, otherwise to Disconnected. `Disconnecting` is
//! reached only through an explicit [`MqttAdapter::disconnect`], which also
//! suppresses the Last Will (the broker only publishes it on ungraceful
//! loss).
//!
//! ## Delivery
//!
//! Subscribes demand a QoS-1 grant; any downgrade in the SubAck aborts the
//! session. Publishes are QoS-1 with retain=false. While the session is not
//! Connected, publishes enqueue into a bounded FIFO queue that drains on the
//! next successful connect; a full or disabled queue fails the operation
//! with `DISCONNECTED`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, SubscribeReasonCode, Transport,
    TlsConfiguration,
};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::topics::TopicAuthorizer;

/// Backoff base wait, seconds.
const BACKOFF_BASE_SECS: f64 = 1.0;
/// Backoff cap, seconds.
const BACKOFF_CAP_SECS: f64 = 32.0;
/// Jitter fraction applied per attempt.
const BACKOFF_JITTER: f64 = 0.2;

/// Transport connection states, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl ConnectionState {
    /// Whether the state machine permits `self → next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Disconnecting)
        )
    }
}

/// Raw message delivered by the broker, before any routing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Exponential reconnect backoff: attempt `n` waits `min(2ⁿ, 32)` seconds
/// with ±20 % jitter; a successful connection resets `n`.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = (BACKOFF_BASE_SECS * 2f64.powi(self.attempt.min(16) as i32))
            .min(BACKOFF_CAP_SECS);
        self.attempt = self.attempt.saturating_add(1);
        let jitter = 1.0 + BACKOFF_JITTER * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64(exp * jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Last Will payload published by the broker on ungraceful disconnect.
pub fn lwt_payload(timestamp_ms: u64) -> Vec<u8> {
    serde_json::json!({"status": "offline", "timestamp_ms": timestamp_ms})
        .to_string()
        .into_bytes()
}

/// Build the rumqttc options for a validated configuration.
pub fn build_mqtt_options(config: &Config, lwt_topic: &str, now_ms: u64) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(
        &config.client_id,
        &config.mqtt.host,
        config.effective_mqtt_port(),
    );
    options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_seconds));
    options.set_last_will(LastWill::new(
        lwt_topic,
        lwt_payload(now_ms),
        QoS::AtLeastOnce,
        false,
    ));

    if let (Some(username), Some(password)) = (&config.mqtt.username, &config.mqtt.password) {
        // Config validation already refused credentials without TLS.
        options.set_credentials(username, password);
    }

    if config.mqtt.use_tls {
        let ca_path = config
            .mqtt
            .ca_cert_path
            .as_ref()
            .ok_or_else(|| Error::config("TLS requires mqtt.ca_cert_path"))?;
        let ca = std::fs::read(ca_path)
            .map_err(|e| Error::config(format!("cannot read CA certificate {}: {}", ca_path, e)))?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(options)
}

struct QueuedPublish {
    topic: String,
    payload: Vec<u8>,
}

/// The broker session owner. Cloneable handles are not exposed; the facade
/// owns one adapter and funnels every publish and subscribe through it.
pub struct MqttAdapter {
    client: AsyncClient,
    authorizer: Arc<TopicAuthorizer>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    pending: Arc<Mutex<VecDeque<QueuedPublish>>>,
    queue_capacity: usize,
    shutdown: Arc<AtomicBool>,
}

impl MqttAdapter {
    /// Start the session: build options, spawn the event-loop task, and
    /// return the adapter plus a receiver for state transitions.
    ///
    /// The canonical subscriptions (own cmd, own res, and the replication
    /// topics when permitted) are authorized up front and re-issued on every
    /// successful connection.
    pub fn start(
        config: &Config,
        authorizer: Arc<TopicAuthorizer>,
        inbound_tx: mpsc::Sender<InboundMessage>,
        now_ms: u64,
    ) -> Result<(Self, watch::Receiver<ConnectionState>)> {
        let scheme = authorizer.scheme();
        let mut subscriptions = vec![scheme.command_topic(), scheme.response_topic()];
        if config.replication.can_subscribe_events {
            subscriptions.push(scheme.replication_events_topic());
            subscriptions.push(scheme.replication_digest_topic());
        }
        for filter in &subscriptions {
            authorizer.check_subscribe(filter)?;
        }

        let options = build_mqtt_options(config, &scheme.response_topic(), now_ms)?;
        let (client, eventloop) = AsyncClient::new(options, 64);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let state_tx = Arc::new(state_tx);
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let adapter = Self {
            client: client.clone(),
            authorizer,
            state_tx: state_tx.clone(),
            pending: pending.clone(),
            queue_capacity: config.publish_queue_capacity,
            shutdown: shutdown.clone(),
        };

        tokio::spawn(session_task(
            eventloop,
            client,
            subscriptions,
            inbound_tx,
            state_tx,
            pending,
            shutdown,
            config.mqtt.auto_reconnect,
        ));

        Ok((adapter, state_rx))
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Publish with QoS-1 and retain=false, queueing while offline.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.authorizer.check_publish(topic)?;
        if self.state() == ConnectionState::Connected {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| Error::disconnected(format!("publish to '{}' failed: {}", topic, e)))
        } else {
            self.enqueue(topic, payload)
        }
    }

    fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::disconnected(
                "transport unavailable and queueing is disabled",
            ));
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.len() >= self.queue_capacity {
            return Err(Error::disconnected(
                "transport unavailable and the publish queue is full",
            ));
        }
        pending.push_back(QueuedPublish {
            topic: topic.to_string(),
            payload,
        });
        debug!("queued publish to '{}' ({} pending)", topic, pending.len());
        Ok(())
    }

    /// Number of queued publishes waiting for a connection.
    pub fn queued(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Graceful disconnect: the broker drops the session without publishing
    /// the Last Will.
    pub async fn disconnect(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Disconnecting);
        self.client
            .disconnect()
            .await
            .map_err(|e| Error::disconnected(format!("disconnect failed: {}", e)))?;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_task(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    pending: Arc<Mutex<VecDeque<QueuedPublish>>>,
    shutdown: Arc<AtomicBool>,
    auto_reconnect: bool,
) {
    let mut backoff = Backoff::new();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt session established");
                state_tx.send_replace(ConnectionState::Connected);
                backoff.reset();
                for filter in &subscriptions {
                    if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
                        error!("re-subscribe to '{}' failed: {}", filter, e);
                    }
                }
                drain_pending(&client, &pending).await;
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let downgraded = ack
                    .return_codes
                    .iter()
                    .any(|code| !matches!(code, SubscribeReasonCode::Success(QoS::AtLeastOnce)));
                if downgraded {
                    error!(
                        "broker did not grant QoS-1 on subscribe ({:?}); aborting session",
                        ack.return_codes
                    );
                    shutdown.store(true, Ordering::SeqCst);
                    let _ = client.disconnect().await;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if inbound_tx.send(message).await.is_err() {
                    warn!("inbound consumer is gone; stopping session task");
                    state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
                if !auto_reconnect {
                    error!("mqtt connection failed: {}; auto-reconnect disabled", e);
                    state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
                state_tx.send_replace(ConnectionState::Reconnecting);
                let delay = backoff.next_delay();
                warn!(
                    "mqtt connection failed: {}; reconnecting in {:.1}s (attempt {})",
                    e,
                    delay.as_secs_f64(),
                    backoff.attempt()
                );
                tokio::time::sleep(delay).await;
                if shutdown.load(Ordering::SeqCst) {
                    state_tx.send_replace(ConnectionState::Disconnected);
                    return;
                }
                state_tx.send_replace(ConnectionState::Connecting);
            }
        }
    }
}

/// Drain the offline queue in FIFO order. A failing publish puts the
/// message back at the front and stops; the next connect retries.
async fn drain_pending(client: &AsyncClient, pending: &Mutex<VecDeque<QueuedPublish>>) {
    loop {
        let next = pending.lock().unwrap().pop_front();
        let Some(message) = next else { return };
        if let Err(e) = client
            .publish(&message.topic, QoS::AtLeastOnce, false, message.payload.clone())
            .await
        {
            warn!("drain publish to '{}' failed: {}", message.topic, e);
            pending.lock().unwrap().push_front(message);
            return;
        }
        debug!("drained queued publish to '{}'", message.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_the_jitter_envelope() {
        let mut backoff = Backoff::new();
        for n in 0..10u32 {
            let expected = (2f64.powi(n as i32)).min(32.0);
            let delay = backoff.next_delay().as_secs_f64();
            assert!(
                delay >= 0.8 * expected - 1e-9 && delay <= 1.2 * expected + 1e-9,
                "attempt {}: delay {} outside [{}, {}]",
                n,
                delay,
                0.8 * expected,
                1.2 * expected
            );
        }
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut backoff = Backoff::new();
        for _ in 0..6 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 6);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let delay = backoff.next_delay().as_secs_f64();
        assert!((0.8..=1.2).contains(&delay));
    }

    #[test]
    fn state_machine_allows_only_specified_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Reconnecting));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
        assert!(Reconnecting.can_transition_to(Connecting));

        // Disconnecting is reached only via explicit disconnect.
        assert!(!Disconnected.can_transition_to(Disconnecting));
        assert!(!Connecting.can_transition_to(Disconnecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn lwt_payload_shape() {
        let payload = lwt_payload(1_637_142_400_000);
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["status"], "offline");
        assert_eq!(value["timestamp_ms"], 1_637_142_400_000u64);
    }

    #[test]
    fn options_carry_identity_and_endpoint() {
        let config = Config::for_node("broker.local", "phone-a", "node-a");
        let options = build_mqtt_options(&config, "mkv/phone-a/res", 1).unwrap();
        assert_eq!(options.client_id(), "phone-a");
        let (host, port) = options.broker_address();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn tls_without_ca_refused() {
        let mut config = Config::for_node("broker.local", "phone-a", "node-a");
        config.mqtt.use_tls = true;
        let err = build_mqtt_options(&config, "mkv/phone-a/res", 1).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
