//! Token protocol: HMAC-SHA256 signed JSON answering a per-connection
//! challenge.

use crate::core::envelope::{VoteEnvelope, VotePayload};
use crate::core::vote::{parse_wire_timestamp, timestamp_from_integer, Vote};
use crate::error::{DecodeError, Result};
use crate::protocol::Decoded;
use crate::utils::crypto;
use crate::utils::keys::{KeyMaterial, TokenSecret};
use serde_json::Value;
use std::time::SystemTime;
use subtle::ConstantTimeEq;
use tracing::instrument;

/// Decode one V2 frame body (magic and length prefix already stripped).
///
/// `expected_challenge` is the value issued on this connection; when it is
/// `Some`, the payload must echo it exactly.
pub fn decode(
    frame: &[u8],
    keys: &KeyMaterial,
    expected_challenge: Option<&str>,
) -> std::result::Result<Decoded, DecodeError> {
    decode_at(frame, keys, expected_challenge, SystemTime::now())
}

/// As [`decode`], stamping timestamp-less votes with `received_at`.
#[instrument(level = "trace", skip_all, fields(len = frame.len()))]
pub fn decode_at(
    frame: &[u8],
    keys: &KeyMaterial,
    expected_challenge: Option<&str>,
    received_at: SystemTime,
) -> std::result::Result<Decoded, DecodeError> {
    let envelope: VoteEnvelope =
        serde_json::from_slice(frame).map_err(|_| DecodeError::MalformedPayload)?;

    let payload = match envelope.token_identifier.as_deref() {
        // Named secret: authenticate the raw bytes before parsing them.
        Some(id) => {
            let secret = keys.token(id).ok_or(DecodeError::UnknownToken)?;
            verify(&envelope, secret)?;
            envelope.parse_payload()?
        }
        // Secret chosen by service name, so the payload must be read first.
        None => {
            let payload = envelope.parse_payload()?;
            let secret = keys
                .resolve_token(None, &payload.service_name)
                .ok_or(DecodeError::UnknownToken)?;
            verify(&envelope, secret)?;
            payload
        }
    };

    if let Some(expected) = expected_challenge {
        let provided = payload.challenge.as_deref().unwrap_or_default();
        if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(DecodeError::ChallengeMismatch);
        }
    }

    let (timestamp, warning) = match &payload.timestamp {
        None => (received_at, None),
        Some(raw) => match wire_timestamp(raw) {
            Some(ts) => (ts, None),
            None => (received_at, Some(DecodeError::BadTimestamp)),
        },
    };

    let VotePayload {
        service_name,
        username,
        address,
        ..
    } = payload;
    let vote = Vote::new(service_name, username, address, timestamp)?;
    Ok(Decoded { vote, warning })
}

fn verify(envelope: &VoteEnvelope, secret: &TokenSecret) -> std::result::Result<(), DecodeError> {
    let signature = envelope.signature_bytes()?;
    if crypto::verify_token(secret.as_bytes(), envelope.payload.as_bytes(), &signature) {
        Ok(())
    } else {
        Err(DecodeError::BadSignature)
    }
}

fn wire_timestamp(raw: &Value) -> Option<SystemTime> {
    match raw {
        Value::Number(n) => n.as_i64().and_then(timestamp_from_integer),
        Value::String(s) => parse_wire_timestamp(s),
        _ => None,
    }
}

/// Sign `vote` as a V2 frame answering `challenge`. Sender side.
pub fn encode(
    vote: &Vote,
    token_identifier: Option<&str>,
    secret: &[u8],
    challenge: &str,
) -> Result<Vec<u8>> {
    let payload = VotePayload::for_vote(vote, challenge);
    VoteEnvelope::sign(token_identifier, secret, &payload)?.to_frame()
}
