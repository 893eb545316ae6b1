//! # Command Engine
//!
//! JSON command/response surface and the engine that executes commands
//! against the local replica.
//!
//! ## Wire Format
//!
//! Commands are JSON objects on the client's command topic:
//! ```json
//! {"id": "req-1", "op": "SET", "key": "user:123", "value": "john_doe"}
//! ```
//! Responses mirror the request id:
//! ```json
//! {"id": "req-1", "status": "OK"}
//! {"id": "req-2", "status": "ERROR", "error": "NOT_FOUND", "error_code": 102}
//! ```
//! Unknown fields are rejected, `op` must be one of the enumerated
//! operations, and the whole encoded request is capped at 512 KiB.
//!
//! ## Execution
//!
//! Every command runs under a deadline. State-changing commands apply to
//! storage first (stamped by the local clock) and then hand exactly one
//! replication event per applied write to the outbound pipeline, waiting for
//! the pipeline's ack before reporting OK. A deadline expiry reports
//! `TIMEOUT`, but the local write stays applied: delivery is at-least-once
//! and callers re-issue with the same id, which the idempotency cache
//! short-circuits.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::clock::LocalClock;
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyCache;
use crate::store::{ApplyOutcome, LwwEngine, StorageEntry};
use crate::validate;

/// Bound on cached responses; oldest entries are evicted beyond this.
const IDEMPOTENCY_CAPACITY: usize = 4096;

/// Enumerated operations accepted on the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Get,
    Set,
    Delete,
    Incr,
    Decr,
    Append,
    Prepend,
    Mget,
    Mset,
}

/// One in-memory request. `id` is the idempotency key; an empty id bypasses
/// the response cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    #[serde(default)]
    pub id: String,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<BTreeMap<String, String>>,
}

impl Command {
    fn bare(id: impl Into<String>, op: Op) -> Self {
        Self {
            id: id.into(),
            op,
            key: None,
            value: None,
            amount: None,
            keys: None,
            pairs: None,
        }
    }

    pub fn get(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(id, Op::Get)
        }
    }

    pub fn set(
        id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::bare(id, Op::Set)
        }
    }

    pub fn delete(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(id, Op::Delete)
        }
    }

    pub fn incr(id: impl Into<String>, key: impl Into<String>, amount: Option<i64>) -> Self {
        Self {
            key: Some(key.into()),
            amount,
            ..Self::bare(id, Op::Incr)
        }
    }

    pub fn decr(id: impl Into<String>, key: impl Into<String>, amount: Option<i64>) -> Self {
        Self {
            key: Some(key.into()),
            amount,
            ..Self::bare(id, Op::Decr)
        }
    }

    pub fn append(
        id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::bare(id, Op::Append)
        }
    }

    pub fn prepend(
        id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::bare(id, Op::Prepend)
        }
    }

    pub fn mget(id: impl Into<String>, keys: Vec<String>) -> Self {
        Self {
            keys: Some(keys),
            ..Self::bare(id, Op::Mget)
        }
    }

    pub fn mset(id: impl Into<String>, pairs: BTreeMap<String, String>) -> Self {
        Self {
            pairs: Some(pairs),
            ..Self::bare(id, Op::Mset)
        }
    }
}

/// Response status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// Wire response. `value` holds GET/INCR/DECR results, `results` the MGET
/// map, `error`/`error_code` the failure tag and its stable code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Response {
    pub id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

impl Response {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Status::Ok,
            value: None,
            results: None,
            error: None,
            error_code: None,
        }
    }

    pub fn ok_value(id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            value: Some(value),
            ..Self::ok(id)
        }
    }

    pub fn ok_results(id: impl Into<String>, results: BTreeMap<String, String>) -> Self {
        Self {
            results: Some(results),
            ..Self::ok(id)
        }
    }

    pub fn from_error(id: impl Into<String>, error: &Error) -> Self {
        Self {
            id: id.into(),
            status: Status::Error,
            value: None,
            results: None,
            error: Some(format!("{} ({})", error.error_tag(), error)),
            error_code: Some(error.error_code()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// One replication event headed for the wire, with an ack channel the
/// command engine awaits under its deadline.
#[derive(Debug)]
pub struct OutboundEvent {
    pub entry: StorageEntry,
    pub ack: oneshot::Sender<Result<()>>,
}

/// Executes commands against the local replica.
///
/// The engine never owns the transport: it pushes [`OutboundEvent`]s into an
/// injected channel, which breaks the command-engine/adapter cycle the same
/// way the facade wires everything else (one-way ownership).
pub struct CommandEngine {
    store: Arc<LwwEngine>,
    clock: Arc<LocalClock>,
    cache: Mutex<IdempotencyCache>,
    outbound: mpsc::Sender<OutboundEvent>,
    command_timeout: Duration,
}

impl CommandEngine {
    pub fn new(
        store: Arc<LwwEngine>,
        clock: Arc<LocalClock>,
        outbound: mpsc::Sender<OutboundEvent>,
        command_timeout: Duration,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            cache: Mutex::new(IdempotencyCache::new(idempotency_ttl, IDEMPOTENCY_CAPACITY)),
            outbound,
            command_timeout,
        }
    }

    /// Execute one command to a definitive response. Errors are encoded in
    /// the response; this function itself never fails.
    pub async fn execute(&self, command: Command) -> Response {
        let id = command.id.clone();

        if let Some(cached) = self.cache.lock().unwrap().get(&id) {
            debug!("idempotent replay for id '{}'", id);
            return cached;
        }

        let outcome = match tokio::time::timeout(self.command_timeout, self.run(&command)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "command '{}' exceeded {} ms deadline",
                id,
                self.command_timeout.as_millis()
            ))),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(error) => Response::from_error(id.clone(), &error),
        };

        // TIMEOUT and DISCONNECTED are not definitive outcomes: the caller
        // re-issues with the same id and the retry must actually execute.
        let definitive = !matches!(response.error_code, Some(105) | Some(106));
        if definitive {
            self.cache.lock().unwrap().insert(&id, response.clone());
        }
        response
    }

    /// Execute a raw command payload received from the transport.
    ///
    /// Returns `None` when no response can be correlated (the id is not
    /// recoverable from the payload); such payloads are logged and dropped.
    pub async fn execute_raw(&self, payload: &[u8]) -> Option<Response> {
        if let Err(error) = validate::validate_bulk_payload(payload.len()) {
            let id = recover_id(payload)?;
            return Some(Response::from_error(id, &error));
        }
        let text = match validate::require_utf8(payload) {
            Ok(text) => text,
            Err(error) => {
                warn!("dropping non-UTF-8 command payload: {}", error);
                return None;
            }
        };
        match serde_json::from_str::<Command>(text) {
            Ok(command) => Some(self.execute(command).await),
            Err(parse_error) => {
                let error =
                    Error::invalid_request(format!("unparseable command: {}", parse_error));
                match recover_id(payload) {
                    Some(id) => Some(Response::from_error(id, &error)),
                    None => {
                        warn!("dropping command without recoverable id: {}", parse_error);
                        None
                    }
                }
            }
        }
    }

    async fn run(&self, command: &Command) -> Result<Response> {
        let encoded = serde_json::to_vec(command)
            .map_err(|e| Error::internal(format!("request encoding failed: {}", e)))?;
        validate::validate_bulk_payload(encoded.len())?;

        match command.op {
            Op::Get => self.run_get(command),
            Op::Set => self.run_set(command).await,
            Op::Delete => self.run_delete(command).await,
            Op::Incr => self.run_incr_decr(command, false).await,
            Op::Decr => self.run_incr_decr(command, true).await,
            Op::Append => self.run_concat(command, false).await,
            Op::Prepend => self.run_concat(command, true).await,
            Op::Mget => self.run_mget(command),
            Op::Mset => self.run_mset(command).await,
        }
    }

    fn run_get(&self, command: &Command) -> Result<Response> {
        let key = require_key(command)?;
        match self.store.get_value(key) {
            Some(value) => Ok(Response::ok_value(
                command.id.clone(),
                serde_json::Value::String(value),
            )),
            None => Err(Error::not_found(key)),
        }
    }

    async fn run_set(&self, command: &Command) -> Result<Response> {
        let key = require_key(command)?;
        let value = require_value(command)?;
        validate::validate_value(value)?;
        self.write_live(key, value.to_string()).await?;
        Ok(Response::ok(command.id.clone()))
    }

    async fn run_delete(&self, command: &Command) -> Result<Response> {
        let key = require_key(command)?;
        let stamp = self.clock.next_write();
        let tombstone = self.store.delete(
            key,
            stamp.timestamp_ms,
            self.clock.node_id(),
            stamp.seq,
        )?;
        self.publish_entry(tombstone).await?;
        Ok(Response::ok(command.id.clone()))
    }

    async fn run_incr_decr(&self, command: &Command, negate: bool) -> Result<Response> {
        let key = require_key(command)?;
        let amount = command.amount.unwrap_or(1);
        let current = match self.store.get_value(key) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| Error::invalid_type(key))?,
            None => 0,
        };
        let next = if negate {
            current.checked_sub(amount)
        } else {
            current.checked_add(amount)
        }
        .ok_or_else(|| Error::range_overflow(key))?;
        self.write_live(key, next.to_string()).await?;
        Ok(Response::ok_value(
            command.id.clone(),
            serde_json::Value::from(next),
        ))
    }

    async fn run_concat(&self, command: &Command, prepend: bool) -> Result<Response> {
        let key = require_key(command)?;
        let value = require_value(command)?;
        let current = self.store.get_value(key).unwrap_or_default();
        let combined = if prepend {
            format!("{}{}", value, current)
        } else {
            format!("{}{}", current, value)
        };
        // The cap applies to the post-operation value, not the operand.
        validate::validate_value(&combined)?;
        self.write_live(key, combined).await?;
        Ok(Response::ok(command.id.clone()))
    }

    fn run_mget(&self, command: &Command) -> Result<Response> {
        let keys = command
            .keys
            .as_ref()
            .ok_or_else(|| Error::invalid_request("MGET requires 'keys'"))?;
        if keys.is_empty() {
            return Err(Error::invalid_request("MGET requires at least one key"));
        }
        if keys.len() > validate::MAX_MGET_KEYS {
            return Err(Error::invalid_request(format!(
                "MGET accepts at most {} keys",
                validate::MAX_MGET_KEYS
            )));
        }
        let mut results = BTreeMap::new();
        for key in keys {
            validate::validate_key(key)?;
            if let Some(value) = self.store.get_value(key) {
                results.insert(key.clone(), value);
            }
        }
        Ok(Response::ok_results(command.id.clone(), results))
    }

    async fn run_mset(&self, command: &Command) -> Result<Response> {
        let pairs = command
            .pairs
            .as_ref()
            .ok_or_else(|| Error::invalid_request("MSET requires 'pairs'"))?;
        if pairs.is_empty() {
            return Err(Error::invalid_request("MSET requires at least one pair"));
        }
        if pairs.len() > validate::MAX_MSET_PAIRS {
            return Err(Error::invalid_request(format!(
                "MSET accepts at most {} pairs",
                validate::MAX_MSET_PAIRS
            )));
        }
        for (key, value) in pairs {
            validate::validate_key(key)?;
            validate::validate_value(value)?;
        }

        let mut entries = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let stamp = self.clock.next_write();
            entries.push(StorageEntry::live(
                key.clone(),
                value.clone(),
                stamp.timestamp_ms,
                self.clock.node_id(),
                stamp.seq,
            ));
        }
        // All pairs land under one write lock: atomic locally.
        let outcomes = self.store.put_many(entries.clone())?;
        for (entry, outcome) in entries.into_iter().zip(outcomes) {
            if outcome == ApplyOutcome::Applied {
                self.publish_entry(entry).await?;
            }
        }
        Ok(Response::ok(command.id.clone()))
    }

    async fn write_live(&self, key: &str, value: String) -> Result<()> {
        validate::validate_key(key)?;
        let stamp = self.clock.next_write();
        let entry = StorageEntry::live(
            key,
            value,
            stamp.timestamp_ms,
            self.clock.node_id(),
            stamp.seq,
        );
        let outcome = self.store.put(entry.clone())?;
        if outcome == ApplyOutcome::Applied {
            self.publish_entry(entry).await?;
        }
        Ok(())
    }

    async fn publish_entry(&self, entry: StorageEntry) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(OutboundEvent {
                entry,
                ack: ack_tx,
            })
            .await
            .map_err(|_| Error::disconnected("replication pipeline is not running"))?;
        ack_rx
            .await
            .map_err(|_| Error::disconnected("replication pipeline dropped the event"))?
    }
}

fn require_key(command: &Command) -> Result<&str> {
    let key = command
        .key
        .as_deref()
        .ok_or_else(|| Error::invalid_request("command requires 'key'"))?;
    validate::validate_key(key)?;
    Ok(key)
}

fn require_value(command: &Command) -> Result<&str> {
    command
        .value
        .as_deref()
        .ok_or_else(|| Error::invalid_request("command requires 'value'"))
}

/// Best-effort extraction of the request id from an unparseable payload, so
/// the caller can still receive a correlated error response.
fn recover_id(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .map(|id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Harness {
        engine: Arc<CommandEngine>,
        clock: Arc<LocalClock>,
        store: Arc<LwwEngine>,
        published: Arc<StdMutex<Vec<StorageEntry>>>,
    }

    /// Engine wired to a pipeline stub that acks every event immediately.
    fn harness() -> Harness {
        let store = Arc::new(LwwEngine::in_memory(86_400_000));
        let clock = Arc::new(LocalClock::new("node-a"));
        let (tx, mut rx) = mpsc::channel::<OutboundEvent>(64);
        let published = Arc::new(StdMutex::new(Vec::new()));
        let sink = published.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().unwrap().push(event.entry.clone());
                let _ = event.ack.send(Ok(()));
            }
        });
        let engine = Arc::new(CommandEngine::new(
            store.clone(),
            clock.clone(),
            tx,
            Duration::from_secs(5),
            Duration::from_secs(60),
        ));
        Harness {
            engine,
            clock,
            store,
            published,
        }
    }

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let h = harness();
        let response = h.engine.execute(Command::set("r1", "user:123", "john_doe")).await;
        assert!(response.is_ok());

        let response = h.engine.execute(Command::get("r2", "user:123")).await;
        assert_eq!(
            response.value,
            Some(serde_json::Value::String("john_doe".into()))
        );

        let response = h.engine.execute(Command::delete("r3", "user:123")).await;
        assert!(response.is_ok());

        let response = h.engine.execute(Command::get("r4", "user:123")).await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.error_code, Some(102));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let h = harness();
        for id in ["d1", "d2", "d3"] {
            let response = h.engine.execute(Command::delete(id, "ghost")).await;
            assert!(response.is_ok(), "DELETE must always return OK");
        }
    }

    #[tokio::test]
    async fn oversize_keys_rejected_by_bytes() {
        let h = harness();
        // 257 ASCII bytes.
        let response = h
            .engine
            .execute(Command::set("s3a", "k".repeat(257), "v"))
            .await;
        assert_eq!(response.error_code, Some(100));
        assert!(response.error.as_deref().unwrap().contains("256 bytes"));

        // 86 euro signs: 258 UTF-8 bytes despite 86 characters.
        let response = h
            .engine
            .execute(Command::set("s3b", "€".repeat(86), "v"))
            .await;
        assert_eq!(response.error_code, Some(100));
    }

    #[tokio::test]
    async fn mset_boundary_at_encoded_request_cap() {
        let h = harness();
        let mut pairs = BTreeMap::new();
        pairs.insert("a".to_string(), "x".repeat(250_000));
        pairs.insert("b".to_string(), "y".repeat(250_000));
        pairs.insert("c".to_string(), String::new());
        let mut command = Command::mset("s4", pairs);

        let base = serde_json::to_vec(&command).unwrap().len();
        let pad = validate::MAX_BULK_PAYLOAD_BYTES - base;
        command
            .pairs
            .as_mut()
            .unwrap()
            .insert("c".to_string(), "z".repeat(pad));
        assert_eq!(
            serde_json::to_vec(&command).unwrap().len(),
            validate::MAX_BULK_PAYLOAD_BYTES
        );

        // Exactly at the cap: accepted.
        let response = h.engine.execute(command.clone()).await;
        assert!(response.is_ok(), "at-cap MSET must succeed: {:?}", response);

        // One byte over: rejected with PAYLOAD_TOO_LARGE.
        command.id = "s4-over".to_string();
        command
            .pairs
            .as_mut()
            .unwrap()
            .insert("c".to_string(), "z".repeat(pad + 1));
        let response = h.engine.execute(command).await;
        assert_eq!(response.error_code, Some(101));
    }

    #[tokio::test]
    async fn mset_is_locally_atomic() {
        let h = harness();
        let mut pairs = BTreeMap::new();
        pairs.insert("good".to_string(), "v".to_string());
        pairs.insert(String::new(), "bad-key".to_string());
        let response = h.engine.execute(Command::mset("m1", pairs)).await;
        assert_eq!(response.error_code, Some(100));
        // Nothing applied, nothing published.
        assert!(h.store.is_empty());
        assert!(h.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn incr_decr_semantics() {
        let h = harness();
        // Missing key counts from zero.
        let response = h.engine.execute(Command::incr("i1", "counter", None)).await;
        assert_eq!(response.value, Some(serde_json::Value::from(1)));

        let response = h
            .engine
            .execute(Command::incr("i2", "counter", Some(5)))
            .await;
        assert_eq!(response.value, Some(serde_json::Value::from(6)));

        let response = h
            .engine
            .execute(Command::decr("i3", "counter", Some(2)))
            .await;
        assert_eq!(response.value, Some(serde_json::Value::from(4)));

        // Non-integer stored value.
        h.engine.execute(Command::set("i4", "name", "alice")).await;
        let response = h.engine.execute(Command::incr("i5", "name", None)).await;
        assert_eq!(response.error_code, Some(103));

        // int64 overflow.
        h.engine
            .execute(Command::set("i6", "max", i64::MAX.to_string()))
            .await;
        let response = h.engine.execute(Command::incr("i7", "max", None)).await;
        assert_eq!(response.error_code, Some(104));

        // And underflow on the other side.
        h.engine
            .execute(Command::set("i8", "min", i64::MIN.to_string()))
            .await;
        let response = h.engine.execute(Command::decr("i9", "min", None)).await;
        assert_eq!(response.error_code, Some(104));
    }

    #[tokio::test]
    async fn append_prepend_create_and_cap() {
        let h = harness();
        let response = h
            .engine
            .execute(Command::append("a1", "greeting", "world"))
            .await;
        assert!(response.is_ok());
        let response = h
            .engine
            .execute(Command::prepend("a2", "greeting", "hello "))
            .await;
        assert!(response.is_ok());
        assert_eq!(
            h.store.get_value("greeting"),
            Some("hello world".to_string())
        );

        // Post-concat size is what gets checked.
        h.engine
            .execute(Command::set(
                "a3",
                "big",
                "x".repeat(validate::MAX_VALUE_BYTES),
            ))
            .await;
        let response = h.engine.execute(Command::append("a4", "big", "y")).await;
        assert_eq!(response.error_code, Some(101));
    }

    #[tokio::test]
    async fn mget_returns_found_subset() {
        let h = harness();
        h.engine.execute(Command::set("g1", "k1", "v1")).await;
        h.engine.execute(Command::set("g2", "k3", "v3")).await;
        let response = h
            .engine
            .execute(Command::mget(
                "g3",
                vec!["k1".into(), "k2".into(), "k3".into()],
            ))
            .await;
        let results = response.results.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.get("k1").map(String::as_str), Some("v1"));
        assert_eq!(results.get("k3").map(String::as_str), Some("v3"));

        let too_many: Vec<String> = (0..validate::MAX_MGET_KEYS + 1)
            .map(|i| format!("k{}", i))
            .collect();
        let response = h.engine.execute(Command::mget("g4", too_many)).await;
        assert_eq!(response.error_code, Some(100));
    }

    #[tokio::test]
    async fn idempotent_replay_short_circuits() {
        // A reissued SET with the same id returns the same response
        // without a second storage mutation or a second published event.
        let h = harness();
        let first = h.engine.execute(Command::set("req-1", "k", "v")).await;
        let seq_after_first = h.clock.current_seq();
        let second = h.engine.execute(Command::set("req-1", "k", "v")).await;
        assert_eq!(first, second);
        assert_eq!(h.clock.current_seq(), seq_after_first);
        assert_eq!(h.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_id_bypasses_the_cache() {
        let h = harness();
        h.engine.execute(Command::set("", "k", "v1")).await;
        h.engine.execute(Command::set("", "k", "v2")).await;
        assert_eq!(h.store.get_value("k"), Some("v2".to_string()));
        assert_eq!(h.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn errors_are_cached_too() {
        let h = harness();
        let first = h.engine.execute(Command::get("e1", "missing")).await;
        assert_eq!(first.error_code, Some(102));
        // The key appears in the meantime, but the replay must return the
        // exact prior response.
        h.engine.execute(Command::set("e2", "missing", "v")).await;
        let replay = h.engine.execute(Command::get("e1", "missing")).await;
        assert_eq!(first, replay);
    }

    #[tokio::test]
    async fn stalled_pipeline_times_out() {
        let store = Arc::new(LwwEngine::in_memory(86_400_000));
        let clock = Arc::new(LocalClock::new("node-a"));
        // Keep the receiver alive but never ack.
        let (tx, _rx) = mpsc::channel::<OutboundEvent>(4);
        let engine = CommandEngine::new(
            store,
            clock.clone(),
            tx,
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        let response = engine.execute(Command::set("t1", "k", "v")).await;
        assert_eq!(response.error_code, Some(105));

        // A timeout is not definitive, so the re-issue really re-executes
        // instead of replaying the cached failure.
        let seq_before = clock.current_seq();
        let response = engine.execute(Command::set("t1", "k", "v")).await;
        assert_eq!(response.error_code, Some(105));
        assert!(clock.current_seq() > seq_before);
    }

    #[tokio::test]
    async fn closed_pipeline_reports_disconnected() {
        let store = Arc::new(LwwEngine::in_memory(86_400_000));
        let clock = Arc::new(LocalClock::new("node-a"));
        let (tx, rx) = mpsc::channel::<OutboundEvent>(4);
        drop(rx);
        let engine = CommandEngine::new(
            store,
            clock,
            tx,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        let response = engine.execute(Command::set("c1", "k", "v")).await;
        assert_eq!(response.error_code, Some(106));
    }

    #[tokio::test]
    async fn raw_payloads_validated_at_the_boundary() {
        let h = harness();

        let raw = br#"{"id":"r1","op":"SET","key":"k","value":"v"}"#;
        let response = h.engine.execute_raw(raw).await.unwrap();
        assert!(response.is_ok());

        // Unknown field.
        let raw = br#"{"id":"r2","op":"SET","key":"k","value":"v","extra":1}"#;
        let response = h.engine.execute_raw(raw).await.unwrap();
        assert_eq!(response.error_code, Some(100));
        assert_eq!(response.id, "r2");

        // Unknown op.
        let raw = br#"{"id":"r3","op":"TRUNCATE"}"#;
        let response = h.engine.execute_raw(raw).await.unwrap();
        assert_eq!(response.error_code, Some(100));

        // Garbage without a recoverable id is dropped.
        assert!(h.engine.execute_raw(b"not json").await.is_none());

        // Invalid UTF-8 is dropped.
        assert!(h.engine.execute_raw(&[0xFF, 0xFE, 0x00]).await.is_none());
    }

    #[test]
    fn command_json_shape_is_stable() {
        let command = Command::set("req-1", "user:123", "john_doe");
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": "req-1",
                "op": "SET",
                "key": "user:123",
                "value": "john_doe"
            })
        );

        let response = Response::ok_value("req-1", serde_json::Value::String("x".into()));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "req-1", "status": "OK", "value": "x"})
        );
    }
}
