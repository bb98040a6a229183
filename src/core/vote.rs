//! The normalized vote record and its wire timestamp rules.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Integers at or above this magnitude are read as milliseconds, smaller
/// ones as seconds. Server lists send both.
pub const MILLIS_THRESHOLD: u64 = 100_000_000_000;

/// A validated vote notification.
///
/// Every field is non-empty; construction goes through [`Vote::new`] (or
/// deserialization, which applies the same check).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawVote")]
pub struct Vote {
    service_name: String,
    username: String,
    address: String,
    #[serde(with = "timestamp_millis")]
    timestamp: SystemTime,
}

impl Vote {
    pub fn new(
        service_name: impl Into<String>,
        username: impl Into<String>,
        address: impl Into<String>,
        timestamp: SystemTime,
    ) -> Result<Self, DecodeError> {
        let vote = Self {
            service_name: service_name.into(),
            username: username.into(),
            address: address.into(),
            timestamp,
        };
        if vote.service_name.is_empty() || vote.username.is_empty() || vote.address.is_empty() {
            return Err(DecodeError::MalformedPayload);
        }
        Ok(vote)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Milliseconds since the Unix epoch (0 for pre-epoch instants)
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Timestamp as sent on the wire: milliseconds, or whole seconds for
    /// instants so early that their millisecond count would read back as
    /// seconds (below [`MILLIS_THRESHOLD`]). Sub-second precision of such
    /// instants is dropped.
    pub fn wire_timestamp(&self) -> u64 {
        let millis = self.timestamp_millis();
        if millis < MILLIS_THRESHOLD {
            millis / 1000
        } else {
            millis
        }
    }

    /// Legacy-protocol plaintext: `VOTE\n<service>\n<user>\n<address>\n<timestamp>\n`,
    /// with the timestamp from [`Vote::wire_timestamp`].
    ///
    /// Fails if a field contains a newline, which the format cannot carry.
    pub fn to_v1_plaintext(&self) -> Result<String, DecodeError> {
        let fields = [&self.service_name, &self.username, &self.address];
        if fields.iter().any(|f| f.contains('\n')) {
            return Err(DecodeError::MalformedPayload);
        }
        Ok(format!(
            "VOTE\n{}\n{}\n{}\n{}\n",
            self.service_name,
            self.username,
            self.address,
            self.wire_timestamp()
        ))
    }

    /// JSON form carried by forwarding transports
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote (from:{} username:{} address:{} timestamp:{})",
            self.service_name,
            self.username,
            self.address,
            self.timestamp_millis()
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVote {
    service_name: String,
    username: String,
    address: String,
    #[serde(with = "timestamp_millis")]
    timestamp: SystemTime,
}

impl TryFrom<RawVote> for Vote {
    type Error = DecodeError;

    fn try_from(raw: RawVote) -> Result<Self, Self::Error> {
        Vote::new(raw.service_name, raw.username, raw.address, raw.timestamp)
    }
}

/// Interpret an integer wire timestamp (seconds or milliseconds).
pub fn timestamp_from_integer(value: i64) -> Option<SystemTime> {
    let value = u64::try_from(value).ok()?;
    let offset = if value >= MILLIS_THRESHOLD {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    };
    UNIX_EPOCH.checked_add(offset)
}

/// Parse a textual wire timestamp; `None` means the caller should fall back
/// to receipt time.
pub fn parse_wire_timestamp(raw: &str) -> Option<SystemTime> {
    raw.trim().parse::<i64>().ok().and_then(timestamp_from_integer)
}

mod timestamp_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(timestamp: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn at_millis(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn test_empty_fields_rejected() {
        let now = SystemTime::now();
        assert_eq!(
            Vote::new("", "Steve", "1.2.3.4", now),
            Err(DecodeError::MalformedPayload)
        );
        assert_eq!(
            Vote::new("ExampleList", "", "1.2.3.4", now),
            Err(DecodeError::MalformedPayload)
        );
        assert_eq!(
            Vote::new("ExampleList", "Steve", "", now),
            Err(DecodeError::MalformedPayload)
        );
    }

    #[test]
    fn test_seconds_and_millis_both_accepted() {
        assert_eq!(
            parse_wire_timestamp("1700000000"),
            Some(at_millis(1_700_000_000_000))
        );
        assert_eq!(
            parse_wire_timestamp("1700000000123"),
            Some(at_millis(1_700_000_000_123))
        );
        assert_eq!(parse_wire_timestamp(" 42 "), Some(at_millis(42_000)));
    }

    #[test]
    fn test_unusable_timestamps() {
        assert_eq!(parse_wire_timestamp(""), None);
        assert_eq!(parse_wire_timestamp("yesterday"), None);
        assert_eq!(parse_wire_timestamp("-5"), None);
        assert_eq!(parse_wire_timestamp("2024-01-01 10:00:00 +0000"), None);
    }

    #[test]
    fn test_v1_plaintext_layout() {
        let vote = Vote::new(
            "ExampleList",
            "Steve",
            "1.2.3.4",
            at_millis(1_700_000_000_123),
        )
        .unwrap();
        assert_eq!(
            vote.to_v1_plaintext().unwrap(),
            "VOTE\nExampleList\nSteve\n1.2.3.4\n1700000000123\n"
        );

        let bad = Vote::new("Example\nList", "Steve", "1.2.3.4", at_millis(1)).unwrap();
        assert_eq!(bad.to_v1_plaintext(), Err(DecodeError::MalformedPayload));
    }

    #[test]
    fn test_early_instants_written_as_seconds() {
        // 1971: the millisecond count sits below the threshold
        let early = at_millis(50_000_000_000);
        let vote = Vote::new("ExampleList", "Steve", "1.2.3.4", early).unwrap();
        assert_eq!(vote.wire_timestamp(), 50_000_000);

        let line = vote.to_v1_plaintext().unwrap();
        let sent = line.lines().nth(4).unwrap();
        assert_eq!(parse_wire_timestamp(sent), Some(early));

        let modern = Vote::new("ExampleList", "Steve", "1.2.3.4", at_millis(MILLIS_THRESHOLD))
            .unwrap();
        assert_eq!(modern.wire_timestamp(), MILLIS_THRESHOLD);
    }

    #[test]
    fn test_json_form() {
        let vote = Vote::new("ExampleList", "Steve", "1.2.3.4", at_millis(1234)).unwrap();
        let json = vote.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"serviceName":"ExampleList","username":"Steve","address":"1.2.3.4","timestamp":1234}"#
        );
        let back: Vote = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vote);

        let empty = r#"{"serviceName":"","username":"Steve","address":"1.2.3.4","timestamp":1}"#;
        assert!(serde_json::from_str::<Vote>(empty).is_err());
    }
}
