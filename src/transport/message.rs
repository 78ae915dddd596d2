//! Wire protocol between `RemoteBroker` and the broker server.
//!
//! Every frame is a JSON text frame. Requests carry a client-chosen `id`
//! that the matching `response`/`error` echoes back; notifications carry the
//! id of the `subscribe` request that opened them.

use serde::{Deserialize, Serialize};

use crate::broker::message::{LogRecord, Message, RecordId};
use crate::utils::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Auth {
        credential: String,
    },
    Ping,
    Append {
        log_key: String,
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<RecordId>,
    },
    ReadRange {
        log_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<RecordId>,
        max_count: usize,
        #[serde(default)]
        block_ms: u64,
    },
    ReadRecent {
        log_key: String,
        count: usize,
    },
    Len {
        log_key: String,
    },
    GetState {
        key: String,
    },
    SetState {
        key: String,
        value: String,
    },
    Publish {
        channel: String,
        message: Message,
    },
    /// Notifications for `channel` are tagged with this request's id.
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        subscription: u64,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Auth { .. } => "auth",
            Operation::Ping => "ping",
            Operation::Append { .. } => "append",
            Operation::ReadRange { .. } => "read_range",
            Operation::ReadRecent { .. } => "read_recent",
            Operation::Len { .. } => "len",
            Operation::GetState { .. } => "get_state",
            Operation::SetState { .. } => "set_state",
            Operation::Publish { .. } => "publish",
            Operation::Subscribe { .. } => "subscribe",
            Operation::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        id: u64,
        result: Reply,
    },
    Error {
        /// Absent when the request could not be parsed at all.
        id: Option<u64>,
        kind: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<RecordId>,
    },
    Notification {
        subscription: u64,
        message: Message,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Reply {
    Done,
    Appended(RecordId),
    Records(Vec<LogRecord>),
    Count(usize),
    State(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Duplicate,
    Invalid,
    Internal,
}

impl ServerMessage {
    pub fn error(id: Option<u64>, err: &Error) -> Self {
        let (kind, record_id) = match err {
            Error::DuplicateRecord(record_id) => (ErrorKind::Duplicate, Some(*record_id)),
            Error::InvalidMessage(_) | Error::Serialization(_) => (ErrorKind::Invalid, None),
            _ => (ErrorKind::Internal, None),
        };
        ServerMessage::Error {
            id,
            kind,
            message: err.to_string(),
            record_id,
        }
    }

    pub fn unauthorized(id: Option<u64>, message: &str) -> Self {
        ServerMessage::Error {
            id,
            kind: ErrorKind::Unauthorized,
            message: message.to_string(),
            record_id: None,
        }
    }
}

/// Rebuild the local error for a failure the server reported.
pub fn into_error(kind: ErrorKind, message: String, record_id: Option<RecordId>) -> Error {
    match (kind, record_id) {
        (ErrorKind::Duplicate, Some(record_id)) => Error::DuplicateRecord(record_id),
        (ErrorKind::Invalid, _) => Error::InvalidMessage(message),
        _ => Error::Rejected(message),
    }
}
