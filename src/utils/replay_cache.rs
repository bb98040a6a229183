//! Spent-challenge ledger.
//!
//! Every V2 challenge is bound to one connection and retired when that
//! connection ends, whatever the outcome. Retired values are remembered for a
//! TTL so the issuer never hands the same value out twice inside that window,
//! and so a message carrying a retired value can be recognised as a replay.
//!
//! The cache expires entries automatically and is bounded with O(1) FIFO
//! eviction.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// TTL-based record of retired challenges
#[derive(Debug)]
pub struct ReplayCache {
    /// Challenge -> when it was retired
    entries: HashMap<String, Instant>,
    /// Insertion order for FIFO eviction
    insertion_order: VecDeque<String>,
    /// Time-to-live for cache entries
    ttl: Duration,
    /// Maximum number of entries to prevent unbounded growth
    max_entries: usize,
}

impl ReplayCache {
    /// Create a new cache with default settings
    ///
    /// Default TTL: 10 minutes (far longer than any connection lives)
    /// Default max entries: 10,000
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(600), 10_000)
    }

    /// Create a cache with custom settings
    pub fn with_settings(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            ttl,
            max_entries,
        }
    }

    /// Mark `challenge` as used. Returns false if it was already retired.
    #[instrument(skip(self, challenge))]
    pub fn retire(&mut self, challenge: &str) -> bool {
        self.cleanup_expired();

        if self.entries.contains_key(challenge) {
            warn!("Challenge retired twice");
            return false;
        }

        if self.entries.len() >= self.max_entries {
            let to_remove = self.entries.len() - self.max_entries + 1;
            self.remove_oldest_entries(to_remove);
        }

        self.entries.insert(challenge.to_string(), Instant::now());
        self.insertion_order.push_back(challenge.to_string());
        true
    }

    /// Whether `challenge` has been retired within the TTL
    pub fn is_spent(&mut self, challenge: &str) -> bool {
        self.cleanup_expired();
        self.entries.contains_key(challenge)
    }

    /// Remove expired entries from the cache
    fn cleanup_expired(&mut self) {
        let now = Instant::now();
        let initial_count = self.entries.len();

        self.entries
            .retain(|_, retired_at| now.duration_since(*retired_at) < self.ttl);

        while let Some(key) = self.insertion_order.front() {
            if !self.entries.contains_key(key) {
                self.insertion_order.pop_front();
            } else {
                break;
            }
        }

        let removed = initial_count - self.entries.len();
        if removed > 0 {
            debug!("Cleaned up {} expired challenge entries", removed);
        }
    }

    #[inline]
    fn remove_oldest_entries(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(key) = self.insertion_order.pop_front() {
                self.entries.remove(&key);
            }
        }

        debug!("Removed {} oldest challenge entries due to size limit", count);
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            ttl_seconds: self.ttl.as_secs(),
        }
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the replay cache
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_seconds: u64,
}
