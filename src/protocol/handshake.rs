//! Greeting and challenge handling.
//!
//! Every accepted connection receives one greeting line. V2-capable
//! listeners put a fresh challenge in it; the peer's signed payload must echo
//! that value. Challenges are scoped to their connection: the handler retires
//! each one when the connection ends, and the issuer never hands out a
//! retired value again while the ledger remembers it.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::ProtocolVersion;
use crate::utils::replay_cache::ReplayCache;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, instrument, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Leading word of every greeting line
pub const GREETING_PREFIX: &str = "VOTIFIER";

/// Random bytes per challenge
pub const CHALLENGE_BYTES: usize = 16;

/// Attempts at drawing an unspent challenge before giving up
const MAX_ISSUE_ATTEMPTS: usize = 4;

/// Single-use connection challenge (lowercase hex)
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Challenge(String);

impl Challenge {
    /// Draw a challenge from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        getrandom::fill(&mut bytes)
            .map_err(|_| ProtocolError::HandshakeError(constants::ERR_RANDOM_SOURCE.into()))?;
        let challenge = Self(hex::encode(bytes));
        bytes.zeroize();
        Ok(challenge)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Challenge(..)")
    }
}

/// Greeting line for a listener, newline included.
///
/// `VOTIFIER 2 <challenge>` when a challenge is issued, `VOTIFIER 1`
/// otherwise.
pub fn greeting_line(challenge: Option<&Challenge>) -> String {
    match challenge {
        Some(challenge) => format!("{GREETING_PREFIX} 2 {}\n", challenge.as_str()),
        None => format!("{GREETING_PREFIX} 1\n"),
    }
}

/// Greeting as seen by a sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerGreeting {
    /// Highest protocol the listener advertises
    pub version: ProtocolVersion,
    pub challenge: Option<String>,
}

impl ServerGreeting {
    /// Parse a greeting line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        if parts.next() != Some(GREETING_PREFIX) {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_INVALID_GREETING.into(),
            ));
        }
        let version = match parts.next() {
            Some("1") => ProtocolVersion::V1,
            Some("2") => ProtocolVersion::V2,
            _ => {
                return Err(ProtocolError::HandshakeError(
                    constants::ERR_INVALID_GREETING.into(),
                ))
            }
        };
        let challenge = parts.next().map(str::to_string);
        if version == ProtocolVersion::V2 && challenge.is_none() {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_NO_CHALLENGE.into(),
            ));
        }
        Ok(Self { version, challenge })
    }
}

/// Hands out challenges and remembers retired ones.
///
/// One per listener, shared by all of its connection handlers.
#[derive(Debug, Default)]
pub struct ChallengeIssuer {
    spent: Mutex<ReplayCache>,
}

impl ChallengeIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: ReplayCache) -> Self {
        Self {
            spent: Mutex::new(ledger),
        }
    }

    /// A fresh challenge that has not been retired.
    #[instrument(skip(self))]
    pub fn issue(&self) -> Result<Challenge> {
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let challenge = Challenge::generate()?;
            if !self.is_spent(challenge.as_str())? {
                return Ok(challenge);
            }
            warn!("Drew an already retired challenge; drawing again");
        }
        Err(ProtocolError::HandshakeError(
            constants::ERR_RANDOM_SOURCE.into(),
        ))
    }

    /// Invalidate `challenge`. Called once per connection, whatever its outcome.
    pub fn retire(&self, challenge: &Challenge) {
        match self.spent.lock() {
            Ok(mut ledger) => {
                ledger.retire(challenge.as_str());
                debug!("Challenge retired");
            }
            Err(_) => warn!("{}", constants::ERR_LOCK_POISONED),
        }
    }

    /// Whether `challenge` was issued and has since been retired
    pub fn is_spent(&self, challenge: &str) -> Result<bool> {
        let mut ledger = self
            .spent
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        Ok(ledger.is_spent(challenge))
    }
}
