//! # Configuration Management
//!
//! Node configuration is loaded from TOML files and covers the MQTT
//! endpoint, the node's identity, topic layout, replication permissions,
//! timing knobs, and optional persistence.
//!
//! ## Example Configuration File (config.toml)
//! ```toml
//! client_id = "phone-a"
//! node_id = "phone-a"
//! topic_prefix = "mkv"
//! persistence_enabled = false
//!
//! [mqtt]
//! host = "broker.example.com"
//! use_tls = false
//! keep_alive_seconds = 30
//! connection_timeout_seconds = 10
//!
//! [replication]
//! can_publish_events = true
//! can_subscribe_events = true
//! ```

use anyhow::Result;
use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Error;
use crate::validate;

/// MQTT endpoint and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Hostname or IP of the MQTT broker.
    pub host: String,

    /// Broker port. When absent, 1883 is used, or 8883 with TLS enabled.
    #[serde(default)]
    pub port: Option<u16>,

    /// Whether to connect over TLS. Mandatory when credentials are set.
    #[serde(default)]
    pub use_tls: bool,

    /// Optional broker credentials. Setting these requires `use_tls`.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// PEM CA certificate used to validate the broker when TLS is on.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    /// MQTT keep-alive, 30..=600 seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,

    /// Connect attempt timeout, at least 1 second.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,

    /// Reconnect automatically with backoff after a lost connection.
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

/// Per-client replication permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Whether this client may publish replication events and digests.
    #[serde(default)]
    pub can_publish_events: bool,

    /// Whether this client may subscribe to replication events and digests.
    #[serde(default = "default_true")]
    pub can_subscribe_events: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            can_publish_events: false,
            can_subscribe_events: true,
        }
    }
}

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// MQTT session identity, unique per connected client.
    pub client_id: String,

    /// Replica identity used in write triples; at most 128 characters.
    pub node_id: String,

    /// Prefix for every canonical topic. Must not contain `+` or `#`.
    pub topic_prefix: String,

    /// Broker settings.
    pub mqtt: MqttConfig,

    /// Replication permissions.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Anti-entropy digest interval in milliseconds.
    #[serde(default = "default_anti_entropy_interval")]
    pub anti_entropy_interval_ms: u64,

    /// How long tombstones are retained before GC, in milliseconds.
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention_ms: u64,

    /// Whether storage is mirrored to disk.
    #[serde(default)]
    pub persistence_enabled: bool,

    /// Directory for persisted state.
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// TTL of cached command responses, in milliseconds.
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_ms: u64,

    /// Capacity of the offline publish queue. Zero disables queueing.
    #[serde(default = "default_publish_queue_capacity")]
    pub publish_queue_capacity: usize,

    /// Per-command deadline in milliseconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

fn default_keep_alive() -> u64 {
    30
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_anti_entropy_interval() -> u64 {
    60_000
}
fn default_tombstone_retention() -> u64 {
    86_400_000
}
fn default_storage_path() -> String {
    std::env::temp_dir()
        .join("merkle_kv_mobile")
        .to_string_lossy()
        .into_owned()
}
fn default_idempotency_ttl() -> u64 {
    300_000
}
fn default_publish_queue_capacity() -> usize {
    256
}
fn default_command_timeout() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a node, suitable for tests and defaults.
    pub fn for_node(
        host: impl Into<String>,
        client_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            node_id: node_id.into(),
            topic_prefix: "mkv".to_string(),
            mqtt: MqttConfig {
                host: host.into(),
                port: None,
                use_tls: false,
                username: None,
                password: None,
                ca_cert_path: None,
                keep_alive_seconds: default_keep_alive(),
                connection_timeout_seconds: default_connection_timeout(),
                auto_reconnect: true,
            },
            replication: ReplicationConfig::default(),
            anti_entropy_interval_ms: default_anti_entropy_interval(),
            tombstone_retention_ms: default_tombstone_retention(),
            persistence_enabled: false,
            storage_path: default_storage_path(),
            idempotency_ttl_ms: default_idempotency_ttl(),
            publish_queue_capacity: default_publish_queue_capacity(),
            command_timeout_ms: default_command_timeout(),
        }
    }

    /// Broker port, with the TLS-aware default applied.
    pub fn effective_mqtt_port(&self) -> u16 {
        self.mqtt
            .port
            .unwrap_or(if self.mqtt.use_tls { 8883 } else { 1883 })
    }

    /// Enforce the cross-field rules the type system cannot express.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.client_id.is_empty() {
            return Err(Error::config("client_id must not be empty"));
        }
        validate::validate_node_id(&self.node_id)
            .map_err(|e| Error::config(format!("node_id invalid: {}", e)))?;
        if self.topic_prefix.is_empty() {
            return Err(Error::config("topic_prefix must not be empty"));
        }
        if self.topic_prefix.contains('+') || self.topic_prefix.contains('#') {
            return Err(Error::config("topic_prefix must not contain MQTT wildcards"));
        }
        if self.mqtt.host.is_empty() {
            return Err(Error::config("mqtt.host must not be empty"));
        }
        if !(30..=600).contains(&self.mqtt.keep_alive_seconds) {
            return Err(Error::config(
                "mqtt.keep_alive_seconds must be in 30..=600",
            ));
        }
        if self.mqtt.connection_timeout_seconds < 1 {
            return Err(Error::config(
                "mqtt.connection_timeout_seconds must be at least 1",
            ));
        }
        let has_credentials = self.mqtt.username.is_some() || self.mqtt.password.is_some();
        if has_credentials && !self.mqtt.use_tls {
            return Err(Error::config(
                "credentials are configured but TLS is disabled; refusing to start",
            ));
        }
        if self.mqtt.use_tls && self.mqtt.ca_cert_path.is_none() {
            return Err(Error::config(
                "TLS requires mqtt.ca_cert_path for strict certificate validation",
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(Error::config("command_timeout_ms must be positive"));
        }
        Ok(())
    }
}
