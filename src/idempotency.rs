//! Bounded response cache keyed by request id.
//!
//! QoS-1 delivery is at-least-once and a command that timed out may still
//! have landed, so callers re-issue with the same id. The cache memoizes the
//! final response per id: a replay short-circuits with the exact prior
//! response instead of re-executing. Entries expire after a fixed TTL and
//! the map is capacity-bounded with oldest-first eviction.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::command::Response;

/// `id → Response` cache with TTL and a capacity bound.
#[derive(Debug)]
pub struct IdempotencyCache {
    entries: HashMap<String, (Response, Instant)>,
    insertion_order: VecDeque<String>,
    ttl: Duration,
    capacity: usize,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Cached response for `id`, if present and not expired.
    pub fn get(&mut self, id: &str) -> Option<Response> {
        self.get_at(id, Instant::now())
    }

    /// Store the response for `id`. Empty ids bypass the cache entirely.
    pub fn insert(&mut self, id: &str, response: Response) {
        self.insert_at(id, response, Instant::now())
    }

    pub fn get_at(&mut self, id: &str, now: Instant) -> Option<Response> {
        if id.is_empty() {
            return None;
        }
        match self.entries.get(id) {
            Some((response, inserted)) if now.duration_since(*inserted) < self.ttl => {
                Some(response.clone())
            }
            Some(_) => {
                self.entries.remove(id);
                None
            }
            None => None,
        }
    }

    pub fn insert_at(&mut self, id: &str, response: Response, now: Instant) {
        if id.is_empty() {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if self.entries.insert(id.to_string(), (response, now)).is_none() {
            self.insertion_order.push_back(id.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Response;

    fn ok_response(id: &str) -> Response {
        Response::ok(id.to_string())
    }

    #[test]
    fn replay_returns_the_exact_prior_response() {
        let mut cache = IdempotencyCache::new(Duration::from_secs(60), 16);
        let response = ok_response("req-1");
        cache.insert("req-1", response.clone());
        assert_eq!(cache.get("req-1"), Some(response));
    }

    #[test]
    fn empty_id_bypasses() {
        let mut cache = IdempotencyCache::new(Duration::from_secs(60), 16);
        cache.insert("", ok_response(""));
        assert!(cache.is_empty());
        assert_eq!(cache.get(""), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = IdempotencyCache::new(Duration::from_millis(100), 16);
        let start = Instant::now();
        cache.insert_at("req-1", ok_response("req-1"), start);
        assert!(cache
            .get_at("req-1", start + Duration::from_millis(99))
            .is_some());
        assert!(cache
            .get_at("req-1", start + Duration::from_millis(100))
            .is_none());
        // The expired entry is dropped from the map.
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_bound_evicts_oldest_first() {
        let mut cache = IdempotencyCache::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        cache.insert_at("a", ok_response("a"), now);
        cache.insert_at("b", ok_response("b"), now);
        cache.insert_at("c", ok_response("c"), now);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("a", now).is_none());
        assert!(cache.get_at("b", now).is_some());
        assert!(cache.get_at("c", now).is_some());
    }
}
