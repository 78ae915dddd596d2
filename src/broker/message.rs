//! Message definitions for the broker
//!
//! `Message` is the canonical wire/log representation exchanged between
//! agents. It is immutable once built: fields are private and only exposed
//! through accessors, and validation runs once at construction (or once at
//! deserialization, which goes through the same checks).
//!
//! `RecordId` is the broker-assigned position of a message inside one durable
//! log. It is made of a millisecond timestamp and a per-millisecond sequence
//! counter, compared lexicographically.

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::Error;

/// Recipient sentinel meaning "every agent".
pub const BROADCAST_RECIPIENT: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    id: String,
    timestamp: String,
    from: String,
    to: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

#[derive(Deserialize)]
struct RawMessage {
    id: String,
    timestamp: String,
    from: String,
    to: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

impl TryFrom<RawMessage> for Message {
    type Error = Error;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Message::from_parts(raw.id, raw.timestamp, raw.from, raw.to, raw.kind, raw.content)
    }
}

impl Message {
    /// Build a new message with a fresh id and the current instant.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, Error> {
        Self::from_parts(
            Uuid::new_v4().to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            from,
            to,
            kind,
            content,
        )
    }

    /// Rebuild a message from all of its fields, e.g. when replaying a log.
    pub fn from_parts(
        id: impl Into<String>,
        timestamp: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, Error> {
        let msg = Self {
            id: id.into(),
            timestamp: timestamp.into(),
            from: from.into(),
            to: to.into(),
            kind: kind.into(),
            content: content.into(),
        };

        if msg.id.trim().is_empty() {
            return Err(Error::InvalidMessage("id must not be empty".into()));
        }
        if msg.from.trim().is_empty() {
            return Err(Error::InvalidMessage("sender must not be empty".into()));
        }
        if msg.to.trim().is_empty() {
            return Err(Error::InvalidMessage("recipient must not be empty".into()));
        }
        if !is_iso8601(&msg.timestamp) {
            return Err(Error::InvalidMessage(format!(
                "timestamp '{}' is not ISO-8601",
                msg.timestamp
            )));
        }

        Ok(msg)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub fn recipient(&self) -> &str {
        &self.to
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// True if `agent` is the recipient or the message is a broadcast.
    pub fn is_addressed_to(&self, agent: &str) -> bool {
        self.to == BROADCAST_RECIPIENT || self.to == agent
    }

    /// Name of the channel dedicated to this sender/recipient pair.
    pub fn directed_channel(&self) -> String {
        format!("{}:to_{}", self.from, self.to)
    }
}

/// RFC 3339, or a local date-time without offset (`2025-01-01T12:00:00.123456`).
fn is_iso8601(timestamp: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(timestamp).is_ok()
        || chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

/// Position of a record inside one durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RecordId {
    pub millis: u64,
    pub seq: u64,
}

impl RecordId {
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The smallest id strictly greater than `self` that is not older than
    /// `now_millis`. An exhausted sequence carries into the next millisecond.
    pub fn successor_at(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            return Self::new(now_millis, 0);
        }
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis.saturating_add(1), 0),
        }
    }

    /// Big-endian encoding; byte order equals id order.
    pub fn to_key(self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&self.millis.to_be_bytes());
        key[8..].copy_from_slice(&self.seq.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 16 {
            return None;
        }
        let millis = u64::from_be_bytes(key[..8].try_into().ok()?);
        let seq = u64::from_be_bytes(key[8..].try_into().ok()?);
        Some(Self::new(millis, seq))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidMessage(format!("invalid record id: {raw}"));
        let (millis, seq) = match raw.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (raw, "0"),
        };
        Ok(Self::new(
            millis.parse().map_err(|_| invalid())?,
            seq.parse().map_err(|_| invalid())?,
        ))
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RecordId {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

/// A message together with the id the log stored it under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: RecordId,
    pub message: Message,
}
