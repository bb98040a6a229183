//! Per-source-address flood protection.
//!
//! Counts connections and votes per IP address over a fixed window. The
//! listener consults it before handing a socket to a handler: an address
//! over either ceiling is refused without a handshake.
//!
//! Entries idle for longer than the quiet period are swept, and the table is
//! bounded with FIFO eviction so a spray of source addresses cannot grow it
//! without limit.

use crate::config::RateLimitConfig;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Connection ceiling reached for this window
    ConnectionCeiling,
    /// Vote ceiling reached for this window
    VoteCeiling,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug, Clone)]
struct AddressEntry {
    window_start: Instant,
    connections: u32,
    votes: u32,
    refused: u64,
    last_seen: Instant,
}

impl AddressEntry {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            connections: 0,
            votes: 0,
            refused: 0,
            last_seen: now,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.connections = 0;
            self.votes = 0;
        }
    }
}

/// Counters for every recently seen source address.
///
/// Not internally synchronized; the listener keeps it behind a mutex.
#[derive(Debug)]
pub struct RateLimitState {
    entries: HashMap<IpAddr, AddressEntry>,
    insertion_order: VecDeque<IpAddr>,
    config: RateLimitConfig,
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            config,
        }
    }

    /// Admission check for a freshly accepted connection.
    ///
    /// Allowed connections are counted; refused ones only bump the refusal
    /// counter so a flooding peer cannot push its own window forward.
    pub fn check_connection(&mut self, addr: IpAddr) -> Admission {
        self.check_connection_at(addr, Instant::now())
    }

    /// Record a successfully decoded vote from `addr`.
    pub fn record_vote(&mut self, addr: IpAddr) {
        self.record_vote_at(addr, Instant::now())
    }

    pub(crate) fn check_connection_at(&mut self, addr: IpAddr, now: Instant) -> Admission {
        self.cleanup_expired(now);

        let max_connections = self.config.max_connections_per_window;
        let max_votes = self.config.max_votes_per_window;
        let window = self.config.window;

        let entry = self.entry(addr, now);
        entry.roll_window(now, window);
        entry.last_seen = now;

        let verdict = if max_votes > 0 && entry.votes >= max_votes {
            Admission::VoteCeiling
        } else if max_connections > 0 && entry.connections >= max_connections {
            Admission::ConnectionCeiling
        } else {
            Admission::Allowed
        };

        match verdict {
            Admission::Allowed => entry.connections += 1,
            _ => {
                entry.refused += 1;
                debug!(%addr, ?verdict, refused = entry.refused, "Connection refused by rate limit");
            }
        }
        verdict
    }

    pub(crate) fn record_vote_at(&mut self, addr: IpAddr, now: Instant) {
        let window = self.config.window;
        let entry = self.entry(addr, now);
        entry.roll_window(now, window);
        entry.votes += 1;
        entry.last_seen = now;
    }

    /// Connections, votes and refusals counted for `addr` in its current window
    pub fn counts(&self, addr: IpAddr) -> Option<(u32, u32, u64)> {
        self.entries
            .get(&addr)
            .map(|e| (e.connections, e.votes, e.refused))
    }

    pub fn tracked_addresses(&self) -> usize {
        self.entries.len()
    }

    fn entry(&mut self, addr: IpAddr, now: Instant) -> &mut AddressEntry {
        if !self.entries.contains_key(&addr) {
            if self.entries.len() >= self.config.max_tracked_addresses {
                let to_remove = self.entries.len() - self.config.max_tracked_addresses + 1;
                self.remove_oldest_entries(to_remove);
            }
            self.insertion_order.push_back(addr);
        }
        self.entries
            .entry(addr)
            .or_insert_with(|| AddressEntry::new(now))
    }

    fn cleanup_expired(&mut self, now: Instant) {
        let quiet = self.config.quiet_period;
        let initial_count = self.entries.len();

        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) < quiet);

        if self.entries.len() != initial_count {
            let entries = &self.entries;
            self.insertion_order.retain(|addr| entries.contains_key(addr));
            debug!(
                removed = initial_count - self.entries.len(),
                "Expired idle rate-limit entries"
            );
        }
    }

    fn remove_oldest_entries(&mut self, count: usize) {
        for _ in 0..count {
            if let Some(addr) = self.insertion_order.pop_front() {
                self.entries.remove(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn config(max_connections: u32, max_votes: u32) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(10),
            max_connections_per_window: max_connections,
            max_votes_per_window: max_votes,
            quiet_period: Duration::from_secs(60),
            max_tracked_addresses: 100,
        }
    }

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    #[test]
    fn test_connection_ceiling_until_window_resets() {
        let mut state = RateLimitState::new(config(2, 0));
        let t0 = Instant::now();

        assert!(state.check_connection_at(A, t0).is_allowed());
        assert!(state.check_connection_at(A, t0).is_allowed());
        assert_eq!(state.check_connection_at(A, t0), Admission::ConnectionCeiling);
        assert_eq!(
            state.check_connection_at(A, t0 + Duration::from_secs(9)),
            Admission::ConnectionCeiling
        );

        // Other addresses are unaffected.
        assert!(state.check_connection_at(B, t0).is_allowed());

        assert!(state
            .check_connection_at(A, t0 + Duration::from_secs(10))
            .is_allowed());
        assert_eq!(state.counts(A), Some((1, 0, 2)));
    }

    #[test]
    fn test_vote_ceiling_refuses_connections() {
        let mut state = RateLimitState::new(config(0, 1));
        let t0 = Instant::now();

        assert!(state.check_connection_at(A, t0).is_allowed());
        state.record_vote_at(A, t0);
        assert_eq!(state.check_connection_at(A, t0), Admission::VoteCeiling);
    }

    #[test]
    fn test_zero_ceilings_disable_limits() {
        let mut state = RateLimitState::new(config(0, 0));
        let t0 = Instant::now();
        for _ in 0..1000 {
            assert!(state.check_connection_at(A, t0).is_allowed());
            state.record_vote_at(A, t0);
        }
    }

    #[test]
    fn test_quiet_entries_expire() {
        let mut state = RateLimitState::new(config(1, 0));
        let t0 = Instant::now();

        state.check_connection_at(A, t0);
        assert_eq!(state.tracked_addresses(), 1);

        state.check_connection_at(B, t0 + Duration::from_secs(61));
        assert_eq!(state.tracked_addresses(), 1);
        assert!(state.counts(A).is_none());
    }

    #[test]
    fn test_table_is_bounded() {
        let mut cfg = config(1, 0);
        cfg.max_tracked_addresses = 5;
        let mut state = RateLimitState::new(cfg);
        let t0 = Instant::now();

        for i in 0..20u8 {
            state.check_connection_at(IpAddr::V4(Ipv4Addr::new(192, 168, 0, i)), t0);
        }
        assert!(state.tracked_addresses() <= 5);
    }
}
