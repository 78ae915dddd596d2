use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::message::RecordId;
use crate::utils::error::Result;

/// Replication cursors, stored as one JSON blob in the local broker's state
/// area so both directions are always recorded together.
///
/// `None` means nothing has been replicated yet and the next read starts at
/// the beginning of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub local_last_id: Option<RecordId>,
    #[serde(default)]
    pub remote_last_id: Option<RecordId>,
    #[serde(default, alias = "last_sync")]
    pub last_sync_timestamp: Option<String>,
}

impl SyncState {
    pub fn new(local_last_id: Option<RecordId>, remote_last_id: Option<RecordId>) -> Self {
        Self {
            local_last_id,
            remote_last_id,
            last_sync_timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }

    pub fn decode(blob: &str) -> Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
