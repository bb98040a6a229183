//! Token-protocol (V2) message structures.
//!
//! The signed payload travels as a JSON *string* inside the envelope so the
//! receiver can verify the exact bytes that were signed before trusting any
//! of its contents.

use crate::core::vote::Vote;
use crate::error::{DecodeError, ProtocolError, Result};
use crate::utils::crypto;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outer V2 message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteEnvelope {
    /// Names the shared secret; when absent the receiver falls back to the
    /// payload's service name, then `default`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_identifier: Option<String>,
    /// Canonical payload JSON, exactly as signed
    pub payload: String,
    /// Base64 (standard alphabet) HMAC-SHA256 of `payload`
    pub signature: String,
}

/// Inner V2 payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub service_name: String,
    pub username: String,
    pub address: String,
    /// Number or numeric string; missing means "use receipt time"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

impl VotePayload {
    /// Payload for `vote`, answering `challenge`. The timestamp follows
    /// [`Vote::wire_timestamp`].
    pub fn for_vote(vote: &Vote, challenge: &str) -> Self {
        Self {
            service_name: vote.service_name().to_string(),
            username: vote.username().to_string(),
            address: vote.address().to_string(),
            timestamp: Some(Value::from(vote.wire_timestamp())),
            challenge: Some(challenge.to_string()),
        }
    }

    /// Canonical serialized form (field order fixed by the struct)
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl VoteEnvelope {
    /// Sign `payload` with `secret` and wrap it.
    pub fn sign(
        token_identifier: Option<&str>,
        secret: &[u8],
        payload: &VotePayload,
    ) -> Result<Self> {
        let payload = payload.to_canonical_json()?;
        let signature = crypto::sign_token(secret, payload.as_bytes())?;
        Ok(Self {
            token_identifier: token_identifier.map(str::to_string),
            payload,
            signature: BASE64.encode(signature),
        })
    }

    /// Decoded signature bytes
    pub fn signature_bytes(&self) -> std::result::Result<Vec<u8>, DecodeError> {
        BASE64
            .decode(self.signature.as_bytes())
            .map_err(|_| DecodeError::BadSignature)
    }

    /// Parse the embedded payload
    pub fn parse_payload(&self) -> std::result::Result<VotePayload, DecodeError> {
        serde_json::from_str(&self.payload).map_err(|_| DecodeError::MalformedPayload)
    }

    /// Full wire frame: magic, big-endian length, JSON body.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        crate::core::codec::encode_v2_frame(&body)
    }
}

/// `{"status":"ok"}` reply body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: String,
}

impl StatusReply {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Parse a reply line sent by a listener
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end()).map_err(ProtocolError::from)
    }
}
