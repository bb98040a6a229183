//! # Protocol Layer
//!
//! Vote decoding, the connection handshake, the per-connection state machine
//! and fan-out of decoded votes.
//!
//! ## Components
//! - **V1 / V2**: stateless decoders turning raw frame bytes plus key material
//!   into a validated [`Vote`] or a [`DecodeError`]
//! - **Handshake**: challenge issuance and the greeting line
//! - **Session**: tagged-state connection lifecycle with explicit effects
//! - **Dispatcher**: isolated fan-out to registered handlers, optional
//!   forwarding and queued delivery
//!
//! ## Protocol Flow
//! ```text
//! Server                          Client
//!   |-- VOTIFIER <v> [challenge] -->|
//!   |<---------- one frame ---------|
//!   |-- {"status":"ok"} (V2 only) ->|
//!   |             close             |
//! ```

pub mod dispatcher;
pub mod handshake;
pub mod session;
pub mod v1;
pub mod v2;


use crate::core::vote::Vote;
use crate::error::DecodeError;
use crate::utils::keys::KeyMaterial;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Wire protocol selected for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// RSA block protocol
    V1,
    /// Token / HMAC protocol
    V2,
}

impl ProtocolVersion {
    /// Decode one frame of this protocol.
    ///
    /// `challenge` is the value issued to the connection; V1 ignores it.
    pub fn decode(
        &self,
        frame: &[u8],
        keys: &KeyMaterial,
        challenge: Option<&str>,
    ) -> Result<Decoded, DecodeError> {
        self.decode_at(frame, keys, challenge, SystemTime::now())
    }

    /// As [`decode`](Self::decode), with an explicit receipt time.
    pub fn decode_at(
        &self,
        frame: &[u8],
        keys: &KeyMaterial,
        challenge: Option<&str>,
        received_at: SystemTime,
    ) -> Result<Decoded, DecodeError> {
        match self {
            ProtocolVersion::V1 => v1::decode_at(frame, keys, received_at),
            ProtocolVersion::V2 => v2::decode_at(frame, keys, challenge, received_at),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1 => f.write_str("v1"),
            ProtocolVersion::V2 => f.write_str("v2"),
        }
    }
}

/// A successfully decoded vote plus any non-fatal finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub vote: Vote,
    /// Currently only [`DecodeError::BadTimestamp`]
    pub warning: Option<DecodeError>,
}

impl Decoded {
    pub fn new(vote: Vote) -> Self {
        Self {
            vote,
            warning: None,
        }
    }
}
