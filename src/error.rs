//! # Error Types
//!
//! Error handling for the vote-reception engine.
//!
//! Two layers of errors exist:
//! - [`DecodeError`]: the per-connection failure taxonomy. Every way a single
//!   vote exchange can go wrong maps to exactly one kind, and the kind is all
//!   that operators ever see (the remote peer only sees a closed socket).
//! - [`ProtocolError`]: crate-wide failures (I/O, configuration, key handling,
//!   server lifecycle). A `DecodeError` converts into a `ProtocolError`.
//!
//! ## Error Categories
//! - **Decode Errors**: malformed frames, bad signatures, challenge mismatches, timeouts
//! - **Cryptographic Errors**: key generation/encoding, block encryption/decryption
//! - **I/O Errors**: socket and key-file failures
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! ## Example Usage
//! ```rust
//! use votifier_protocol::error::{DecodeError, ProtocolError, Result};
//!
//! fn reject() -> Result<()> {
//!     Err(DecodeError::BadSignature.into())
//! }
//!
//! match reject() {
//!     Err(ProtocolError::Decode(kind)) => assert_eq!(kind.kind(), "bad_signature"),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Shared-state errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Handshake errors
    pub const ERR_RANDOM_SOURCE: &str = "OS random source unavailable";
    pub const ERR_INVALID_GREETING: &str = "Invalid server greeting";
    pub const ERR_NO_CHALLENGE: &str = "Server greeting did not carry a challenge";
    pub const ERR_SERVER_REJECTED: &str = "Server did not acknowledge the vote";

    /// Key material errors
    pub const ERR_EMPTY_TOKEN: &str = "Token secret cannot be empty";
    pub const ERR_KEYS_MISSING: &str = "RSA key files not found and generation is disabled";
}

/// Per-connection failure kinds.
///
/// The set is closed: the connection handler, the decoders and the listener
/// all report failures with one of these, and the metrics sink counts them by
/// kind. None of them is ever echoed to the remote peer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecodeError {
    /// Decryption or block verification failed. Deliberately uniform: a wrong
    /// key and a corrupt block are indistinguishable.
    #[error("Cryptographic failure")]
    CryptoFailure,

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Unknown opcode")]
    UnknownOpcode,

    #[error("Unknown token identifier")]
    UnknownToken,

    /// Non-fatal: the vote is kept and stamped with its receipt time.
    #[error("Unparseable timestamp")]
    BadTimestamp,

    #[error("Signature mismatch")]
    BadSignature,

    #[error("Challenge mismatch")]
    ChallengeMismatch,

    #[error("Frame exceeds maximum size")]
    FrameTooLarge,

    #[error("Read timed out")]
    Timeout,

    /// Pre-handshake refusal. Counted, never logged as a protocol failure.
    #[error("Rate limited")]
    RateLimited,
}

impl DecodeError {
    /// Every kind, in metrics-slot order.
    pub const ALL: [DecodeError; 10] = [
        DecodeError::CryptoFailure,
        DecodeError::MalformedPayload,
        DecodeError::UnknownOpcode,
        DecodeError::UnknownToken,
        DecodeError::BadTimestamp,
        DecodeError::BadSignature,
        DecodeError::ChallengeMismatch,
        DecodeError::FrameTooLarge,
        DecodeError::Timeout,
        DecodeError::RateLimited,
    ];

    /// Stable label used in structured logs and metric names.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::CryptoFailure => "crypto_failure",
            DecodeError::MalformedPayload => "malformed_payload",
            DecodeError::UnknownOpcode => "unknown_opcode",
            DecodeError::UnknownToken => "unknown_token",
            DecodeError::BadTimestamp => "bad_timestamp",
            DecodeError::BadSignature => "bad_signature",
            DecodeError::ChallengeMismatch => "challenge_mismatch",
            DecodeError::FrameTooLarge => "frame_too_large",
            DecodeError::Timeout => "timeout",
            DecodeError::RateLimited => "rate_limited",
        }
    }

    /// Whether this kind terminates the connection without a vote.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::BadTimestamp)
    }

    /// Index into per-kind counter arrays.
    pub(crate) fn slot(&self) -> usize {
        *self as usize
    }
}

/// Failures of the crypto codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key encoding failed: {0}")]
    KeyEncoding(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    Encryption,

    /// Uniform decryption failure; carries no detail on purpose.
    #[error("Decryption failed")]
    Decryption,

    #[error("Invalid HMAC key")]
    InvalidMacKey,
}

/// Error reported by a downstream vote handler or forwarding sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Vote handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_match_all_order() {
        for (i, kind) in DecodeError::ALL.iter().enumerate() {
            assert_eq!(kind.slot(), i);
        }
    }

    #[test]
    fn test_only_bad_timestamp_is_lenient() {
        let lenient: Vec<_> = DecodeError::ALL
            .iter()
            .filter(|k| !k.is_fatal())
            .collect();
        assert_eq!(lenient, vec![&DecodeError::BadTimestamp]);
    }

    #[test]
    fn test_crypto_failure_display_is_uniform() {
        assert_eq!(CryptoError::Decryption.to_string(), "Decryption failed");
        assert_eq!(DecodeError::CryptoFailure.to_string(), "Cryptographic failure");
    }
}
