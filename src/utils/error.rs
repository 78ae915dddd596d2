//! The `error` module defines the error taxonomy shared by every layer of
//! `bicameral`.
//!
//! Transport-level failures (`NoEndpointAvailable`, `ConnectionLost`) are
//! recoverable by reconnecting. `DuplicateRecord` is reported separately from
//! them so that id-preserving appends can treat it as success without masking
//! genuine failures.

use thiserror::Error;

use crate::broker::message::RecordId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no endpoint available ({tried} tried)")]
    NoEndpointAvailable { tried: usize },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("record {0} already present in log")]
    DuplicateRecord(RecordId),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("request rejected by broker: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the failure came from the link to the broker rather than from
    /// the request itself. Only these are worth a reconnect-and-retry.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::NoEndpointAvailable { .. }
        )
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Error::ConnectionLost(err.to_string())
    }
}
