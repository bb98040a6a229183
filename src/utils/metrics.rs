//! Observability and Metrics
//!
//! The internal sink that connection failures are reported to. Each listener
//! owns one [`Metrics`] instance (shared with its handlers through an `Arc`),
//! so independent listeners in the same process never mix their counts.
//!
//! Uses atomic counters for thread-safe metrics collection.

use crate::error::DecodeError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Counters for one listener
#[derive(Debug)]
pub struct Metrics {
    /// Total connections accepted (including refused ones)
    pub connections_total: AtomicU64,
    /// Connections currently being handled
    pub connections_active: AtomicU64,
    /// Votes decoded and dispatched
    pub votes_received: AtomicU64,
    /// Connections refused by the rate limiter or the connection cap
    pub rate_limited: AtomicU64,
    /// Total bytes read from peers
    pub bytes_received: AtomicU64,
    /// Failures by kind, indexed in `DecodeError::ALL` order
    failures: [AtomicU64; DecodeError::ALL.len()],
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            votes_received: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            failures: Default::default(),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a connection refused before handshake
    pub fn connection_refused(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        self.failures[DecodeError::RateLimited.slot()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decoded vote
    pub fn vote_received(&self) {
        self.votes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a failure of the given kind
    pub fn failure(&self, kind: DecodeError) {
        self.failures[kind.slot()].fetch_add(1, Ordering::Relaxed);
    }

    /// Failures recorded so far for `kind`
    pub fn failures(&self, kind: DecodeError) -> u64 {
        self.failures[kind.slot()].load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            votes_received: self.votes_received.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            failures: DecodeError::ALL
                .iter()
                .map(|kind| (*kind, self.failures(*kind)))
                .filter(|(_, count)| *count > 0)
                .collect(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            votes_received = snapshot.votes_received,
            rate_limited = snapshot.rate_limited,
            bytes_received = snapshot.bytes_received,
            uptime_seconds = snapshot.uptime_seconds,
            "Listener metrics snapshot"
        );
        for (kind, count) in &snapshot.failures {
            info!(kind = kind.kind(), count, "Connection failures");
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub votes_received: u64,
    pub rate_limited: u64,
    pub bytes_received: u64,
    /// Non-zero failure counts by kind
    pub failures: Vec<(DecodeError, u64)>,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}
