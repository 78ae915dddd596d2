//! Durable log backed by `sled`
//!
//! Each log key gets its own tree (`log:<key>`). Records are keyed by the
//! 16-byte big-endian encoding of their `RecordId`, so a plain tree scan
//! yields records in id order and ranged reads are cheap.
//!
//! Small state blobs (e.g. sync cursors) live in a separate `state` tree of
//! the same database, so they travel with the log they describe.
//!
//! Id assignment runs in one transaction over the log tree and the
//! `high_water` tree, which holds the highest id ever written per log:
//! - without an explicit id the next id is the successor of the high-water
//!   mark at the current wall clock, so it sorts after every record a reader
//!   could already have seen
//! - with an explicit id the record is inserted only if that key is absent,
//!   otherwise `Error::DuplicateRecord` is returned and the tree is untouched
//! - either way the mark is raised to the new id when it is higher

use std::ops::Bound;
use std::path::Path;

use chrono::Utc;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::{Db, Transactional, Tree};
use tracing::warn;

use crate::broker::message::{LogRecord, Message, RecordId};
use crate::utils::error::{Error, Result};

const STATE_TREE: &str = "state";
const HIGH_WATER_TREE: &str = "high_water";

#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A database that is removed when the last handle is dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn log_tree(&self, log_key: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("log:{log_key}"))?)
    }

    /// Append `message` to the log, under `id` when given.
    pub fn append(&self, log_key: &str, message: &Message, id: Option<RecordId>) -> Result<RecordId> {
        let tree = self.log_tree(log_key)?;
        let marks = self.db.open_tree(HIGH_WATER_TREE)?;
        let payload = serde_json::to_vec(message)?;
        // logs written before the mark existed start from their last key
        let last = match tree.last()? {
            Some((key, _)) => RecordId::from_key(&key),
            None => None,
        };

        let result = (&tree, &marks).transaction(|(log, marks)| -> ConflictableTransactionResult<RecordId, Error> {
            let mark = match marks.get(log_key.as_bytes())? {
                Some(raw) => RecordId::from_key(&raw),
                None => last,
            };

            let assigned = match id {
                Some(id) => {
                    if log.get(id.to_key())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(Error::DuplicateRecord(id)));
                    }
                    id
                }
                None => {
                    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
                    let mut next = match mark {
                        Some(mark) => mark.successor_at(now),
                        None => RecordId::new(now, 0),
                    };
                    while log.get(next.to_key())?.is_some() {
                        next = next.successor_at(now);
                    }
                    next
                }
            };

            log.insert(&assigned.to_key()[..], payload.as_slice())?;
            let high = mark.map_or(assigned, |mark| mark.max(assigned));
            marks.insert(log_key.as_bytes(), &high.to_key()[..])?;
            Ok(assigned)
        });

        match result {
            Ok(id) => Ok(id),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    /// Records strictly after `after` (from the start when `None`), oldest
    /// first, at most `max_count` of them.
    pub fn read_after(
        &self,
        log_key: &str,
        after: Option<RecordId>,
        max_count: usize,
    ) -> Result<Vec<LogRecord>> {
        let tree = self.log_tree(log_key)?;
        let iter = match after {
            Some(id) => tree.range::<[u8; 16], _>((Bound::Excluded(id.to_key()), Bound::Unbounded)),
            None => tree.iter(),
        };

        let mut records = Vec::new();
        for entry in iter {
            if records.len() >= max_count {
                break;
            }
            let (key, value) = entry?;
            if let Some(record) = decode_record(log_key, &key, &value) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// The last `count` records, most recent first.
    pub fn read_recent(&self, log_key: &str, count: usize) -> Result<Vec<LogRecord>> {
        let tree = self.log_tree(log_key)?;
        let mut records = Vec::new();
        for entry in tree.iter().rev() {
            if records.len() >= count {
                break;
            }
            let (key, value) = entry?;
            if let Some(record) = decode_record(log_key, &key, &value) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn len(&self, log_key: &str) -> Result<usize> {
        Ok(self.log_tree(log_key)?.len())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let tree = self.db.open_tree(STATE_TREE)?;
        match tree.get(key)? {
            Some(raw) => Ok(Some(
                String::from_utf8(raw.to_vec())
                    .map_err(|e| Error::PersistenceFailure(format!("state '{key}': {e}")))?,
            )),
            None => Ok(None),
        }
    }

    /// Replace the blob stored under `key` in a single write.
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let tree = self.db.open_tree(STATE_TREE)?;
        tree.insert(key, value.as_bytes())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_record(log_key: &str, key: &[u8], value: &[u8]) -> Option<LogRecord> {
    let Some(id) = RecordId::from_key(key) else {
        warn!(log_key, "skipping record with malformed key");
        return None;
    };
    match serde_json::from_slice::<Message>(value) {
        Ok(message) => Some(LogRecord { id, message }),
        Err(e) => {
            warn!(log_key, record_id = %id, "skipping undecodable record: {e}");
            None
        }
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
