//! Bounded per-device replay cache.
//!
//! Stores recently-accepted nonces. Entries expire after the longest
//! tier TTL (a nonce on an expired message is rejected by the time
//! check before the cache is ever consulted), and the cache evicts its
//! oldest entry on overflow. Eviction order equals insertion order;
//! since a cache hit means a replay and is rejected rather than
//! refreshed, insertion order and LRU order coincide.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Bounded nonce cache with TTL and oldest-first eviction.
///
/// Not internally synchronized; the verifier wraps it in a mutex so the
/// check-then-insert sequence is atomic per device.
#[derive(Debug)]
pub struct NonceCache {
    capacity: usize,
    ttl: Duration,
    /// nonce -> expiry instant
    entries: HashMap<Vec<u8>, Instant>,
    /// insertion order, oldest first
    order: VecDeque<Vec<u8>>,
}

impl NonceCache {
    /// Create a cache bounded to `capacity` nonces, each living `ttl`.
    ///
    /// Capacity should be sized to expected delivery throughput times
    /// the maximum tier TTL.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Whether a live entry for this nonce exists.
    ///
    /// Reaps expired entries first, so a nonce whose message TTL has
    /// fully elapsed reads as unseen again.
    pub fn contains(&mut self, nonce: &[u8]) -> bool {
        self.evict_expired(Instant::now());
        self.entries.contains_key(nonce)
    }

    /// Atomically check a nonce and record it.
    ///
    /// Returns `true` when the nonce was unseen (now recorded), `false`
    /// on a replay.
    pub fn check_and_insert(&mut self, nonce: &[u8]) -> bool {
        let now = Instant::now();
        self.evict_expired(now);

        if self.entries.contains_key(nonce) {
            return false;
        }

        if self.entries.len() == self.capacity {
            self.evict_oldest();
        }

        self.entries.insert(nonce.to_vec(), now + self.ttl);
        self.order.push_back(nonce.to_vec());
        true
    }

    /// Number of live nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no nonces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.order.front().cloned() {
            match self.entries.get(&front) {
                Some(expiry) if *expiry <= now => {
                    self.order.pop_front();
                    self.entries.remove(&front);
                }
                // Front entry may already be gone after an overflow
                // eviction removed it out of order.
                None => {
                    self.order.pop_front();
                }
                _ => break,
            }
        }
    }

    fn evict_oldest(&mut self) {
        while let Some(nonce) = self.order.pop_front() {
            if self.entries.remove(&nonce).is_some() {
                break;
            }
        }
    }
}
