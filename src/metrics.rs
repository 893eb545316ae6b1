//! Metrics sink abstraction.
//!
//! The core never touches a process-wide registry. Components that count
//! things (topic authorizer, replication pipeline, anti-entropy loop) receive
//! an `Arc<dyn MetricsSink>` at construction and call `increment` with a
//! static counter name. Deployments plug in whatever backend they use; tests
//! plug in the in-memory sink and assert on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[cfg(test)]
use mockall::automock;

/// Counter sink injected into core components.
#[cfg_attr(test, automock)]
pub trait MetricsSink: Send + Sync {
    /// Increment the named counter by one.
    fn increment(&self, name: &str);
}

/// Sink that discards every increment. The default when callers do not care.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _name: &str) {}
}

/// In-memory sink backed by atomic counters, usable concurrently.
///
/// Counter names are registered lazily on first increment.
#[derive(Debug, Default)]
pub struct InMemorySink {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if it was never incremented.
    pub fn get(&self, name: &str) -> u64 {
        let counters = self.counters.read().unwrap();
        counters.get(name).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Snapshot of all counters, for logging and diagnostics.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        let counters = self.counters.read().unwrap();
        counters
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }
}

impl MetricsSink for InMemorySink {
    fn increment(&self, name: &str) {
        {
            let counters = self.counters.read().unwrap();
            if let Some(counter) = counters.get(name) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().unwrap();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_counts() {
        let sink = InMemorySink::new();
        assert_eq!(sink.get("authorizer.checks_total"), 0);
        sink.increment("authorizer.checks_total");
        sink.increment("authorizer.checks_total");
        sink.increment("replication.applied");
        assert_eq!(sink.get("authorizer.checks_total"), 2);
        assert_eq!(sink.get("replication.applied"), 1);
        assert_eq!(sink.snapshot().len(), 2);
    }

    #[test]
    fn in_memory_sink_is_concurrent() {
        let sink = Arc::new(InMemorySink::new());
        let mut handles = vec![];
        for _ in 0..4 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    sink.increment("shared");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sink.get("shared"), 4000);
    }
}
