//! # Canonical Topics and Authorization
//!
//! All traffic lives under a configurable prefix `P`:
//!
//! - `P/<client_id>/cmd` — commands addressed to one client
//! - `P/<client_id>/res` — that client's responses (and its LWT)
//! - `P/replication/events` — replication events for the whole fleet
//! - `P/replication/digest` — anti-entropy digests, same namespace
//!
//! The authorizer sits in front of every publish and subscribe. A client may
//! use its own cmd/res topics and, permission bits allowing, the replication
//! topics; every other client's cmd/res topics are denied, and so is any
//! subscription filter that points a `+`/`#` wildcard at the canonical
//! namespace. Checks and denials are counted through the injected metrics
//! sink.

use std::sync::Arc;

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;

/// Reserved path segment for replication topics; no client may claim it.
const REPLICATION_SEGMENT: &str = "replication";

/// Canonical topic construction and classification for one client.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
    client_id: String,
}

/// What a canonical topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// `P/<client_id>/cmd`
    Command { client_id: String },
    /// `P/<client_id>/res`
    Response { client_id: String },
    /// `P/replication/events`
    ReplicationEvents,
    /// `P/replication/digest`
    ReplicationDigest,
}

impl TopicScheme {
    pub fn new(prefix: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// This client's command topic.
    pub fn command_topic(&self) -> String {
        self.command_topic_for(&self.client_id)
    }

    /// This client's response topic.
    pub fn response_topic(&self) -> String {
        self.response_topic_for(&self.client_id)
    }

    pub fn command_topic_for(&self, client_id: &str) -> String {
        format!("{}/{}/cmd", self.prefix, client_id)
    }

    pub fn response_topic_for(&self, client_id: &str) -> String {
        format!("{}/{}/res", self.prefix, client_id)
    }

    pub fn replication_events_topic(&self) -> String {
        format!("{}/{}/events", self.prefix, REPLICATION_SEGMENT)
    }

    pub fn replication_digest_topic(&self) -> String {
        format!("{}/{}/digest", self.prefix, REPLICATION_SEGMENT)
    }

    /// Classify a topic inside the canonical namespace. `None` for anything
    /// outside it or not matching the canonical shapes.
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let mut segments = rest.split('/');
        let first = segments.next()?;
        let second = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        match (first, second) {
            (REPLICATION_SEGMENT, "events") => Some(TopicKind::ReplicationEvents),
            (REPLICATION_SEGMENT, "digest") => Some(TopicKind::ReplicationDigest),
            (client, "cmd") if !client.is_empty() => Some(TopicKind::Command {
                client_id: client.to_string(),
            }),
            (client, "res") if !client.is_empty() => Some(TopicKind::Response {
                client_id: client.to_string(),
            }),
            _ => None,
        }
    }

    /// Whether a filter targets the canonical namespace.
    fn targets_namespace(&self, filter: &str) -> bool {
        filter == self.prefix || filter.starts_with(&format!("{}/", self.prefix))
    }
}

/// Allow/deny decisions for every publish and subscribe the adapter makes.
pub struct TopicAuthorizer {
    scheme: TopicScheme,
    can_publish_events: bool,
    can_subscribe_events: bool,
    metrics: Arc<dyn MetricsSink>,
}

impl TopicAuthorizer {
    pub fn new(
        scheme: TopicScheme,
        replication: &ReplicationConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            scheme,
            can_publish_events: replication.can_publish_events,
            can_subscribe_events: replication.can_subscribe_events,
            metrics,
        }
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Authorize a publish. Own cmd/res are always allowed; the replication
    /// topics require the publish permission; everything else is denied.
    pub fn check_publish(&self, topic: &str) -> Result<()> {
        self.metrics.increment("authorizer.checks_total");
        if topic.contains('+') || topic.contains('#') {
            return self.deny_wildcard(topic, "publish topic contains a wildcard");
        }
        match self.scheme.parse(topic) {
            Some(TopicKind::Command { client_id }) if client_id == self.scheme.client_id => {
                Ok(())
            }
            Some(TopicKind::Response { client_id }) if client_id == self.scheme.client_id => {
                Ok(())
            }
            Some(TopicKind::Command { .. }) => {
                self.deny(topic, "authorizer.denied.command", "foreign command topic")
            }
            Some(TopicKind::Response { .. }) => {
                self.deny(topic, "authorizer.denied.response", "foreign response topic")
            }
            Some(TopicKind::ReplicationEvents) | Some(TopicKind::ReplicationDigest) => {
                if self.can_publish_events {
                    Ok(())
                } else {
                    self.deny(
                        topic,
                        "authorizer.denied.replication",
                        "replication publish not permitted for this client",
                    )
                }
            }
            None => self.deny(
                topic,
                "authorizer.denied.foreign",
                "topic outside the canonical namespace",
            ),
        }
    }

    /// Authorize a subscription filter. Wildcards over the canonical
    /// namespace (or naming cmd/res) are denied outright; otherwise only the
    /// own cmd/res topics and the replication topics are subscribable.
    pub fn check_subscribe(&self, filter: &str) -> Result<()> {
        self.metrics.increment("authorizer.checks_total");
        let has_wildcard = filter.contains('+') || filter.contains('#');
        if has_wildcard
            && (self.scheme.targets_namespace(filter)
                || filter.contains("/cmd")
                || filter.contains("/res"))
        {
            return self.deny_wildcard(filter, "wildcard filter over the canonical namespace");
        }
        match self.scheme.parse(filter) {
            Some(TopicKind::Command { client_id }) if client_id == self.scheme.client_id => {
                Ok(())
            }
            Some(TopicKind::Response { client_id }) if client_id == self.scheme.client_id => {
                Ok(())
            }
            Some(TopicKind::Command { .. }) => {
                self.deny(filter, "authorizer.denied.command", "foreign command topic")
            }
            Some(TopicKind::Response { .. }) => {
                self.deny(filter, "authorizer.denied.response", "foreign response topic")
            }
            Some(TopicKind::ReplicationEvents) | Some(TopicKind::ReplicationDigest) => {
                if self.can_subscribe_events {
                    Ok(())
                } else {
                    self.deny(
                        filter,
                        "authorizer.denied.replication",
                        "replication subscribe not permitted for this client",
                    )
                }
            }
            None => self.deny(
                filter,
                "authorizer.denied.foreign",
                "filter outside the canonical namespace",
            ),
        }
    }

    fn deny(&self, topic: &str, counter: &'static str, reason: &str) -> Result<()> {
        self.metrics.increment(counter);
        Err(Error::unauthorized(topic, reason))
    }

    fn deny_wildcard(&self, topic: &str, reason: &str) -> Result<()> {
        self.metrics.increment("authorizer.denied.wildcard");
        Err(Error::unauthorized(topic, reason))
    }
}
