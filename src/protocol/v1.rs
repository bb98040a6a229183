//! Legacy RSA block protocol.
//!
//! The peer sends one PKCS#1 v1.5 block, encrypted with the listener's
//! public key, holding `VOTE\n<service>\n<username>\n<address>\n<timestamp>\n`.

use crate::core::vote::{parse_wire_timestamp, Vote};
use crate::error::{DecodeError, Result};
use crate::protocol::Decoded;
use crate::utils::crypto;
use crate::utils::keys::KeyMaterial;
use rsa::RsaPublicKey;
use std::time::SystemTime;
use tracing::instrument;
use zeroize::Zeroizing;

/// First plaintext line of every V1 vote
pub const OPCODE: &str = "VOTE";

/// Plaintext lines including the empty terminator
pub const FIELD_COUNT: usize = 6;

/// Decode one V1 block using the listener's private key.
pub fn decode(frame: &[u8], keys: &KeyMaterial) -> std::result::Result<Decoded, DecodeError> {
    decode_at(frame, keys, SystemTime::now())
}

/// As [`decode`], stamping timestamp-less votes with `received_at`.
#[instrument(level = "trace", skip_all, fields(len = frame.len()))]
pub fn decode_at(
    frame: &[u8],
    keys: &KeyMaterial,
    received_at: SystemTime,
) -> std::result::Result<Decoded, DecodeError> {
    let pair = keys.rsa().ok_or(DecodeError::UnknownOpcode)?;

    let plain = Zeroizing::new(
        crypto::decrypt_block(pair.private_key(), frame).map_err(|_| DecodeError::CryptoFailure)?,
    );
    // Valid padding over garbage (wrong key) almost never yields UTF-8.
    let text = std::str::from_utf8(&plain).map_err(|_| DecodeError::CryptoFailure)?;

    let fields: Vec<&str> = text.split('\n').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(DecodeError::MalformedPayload);
    }
    if fields[0] != OPCODE {
        return Err(DecodeError::UnknownOpcode);
    }
    if !fields[5].is_empty() {
        return Err(DecodeError::MalformedPayload);
    }

    let (timestamp, warning) = match parse_wire_timestamp(fields[4]) {
        Some(ts) => (ts, None),
        None => (received_at, Some(DecodeError::BadTimestamp)),
    };

    let vote = Vote::new(fields[1], fields[2], fields[3], timestamp)?;
    Ok(Decoded { vote, warning })
}

/// Encrypt `vote` into a V1 block for `public`. Sender side.
pub fn encode(vote: &Vote, public: &RsaPublicKey) -> Result<Vec<u8>> {
    let plain = Zeroizing::new(vote.to_v1_plaintext()?);
    Ok(crypto::encrypt_block(public, plain.as_bytes())?)
}
