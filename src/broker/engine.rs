//! Broker engine
//!
//! The in-process implementation of `LogBroker`:
//! - durable log and state blobs through `Persistence` (sled)
//! - notification channels as `Topic`s, created lazily on first use
//! - blocking tail-reads woken by a `Notify` pinged after every append
//!
//! Concurrency and usage notes:
//! - All methods take `&self`; the engine is shared as `Arc<Broker>` between
//!   the WebSocket server tasks and any in-process user.
//! - The topic map lock is never held across an await point.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::broker::message::{LogRecord, Message, RecordId};
use crate::broker::topic::Topic;
use crate::broker::{LogBroker, MessageStream};
use crate::persistence::Persistence;
use crate::utils::error::Result;

#[derive(Debug)]
pub struct Broker {
    persistence: Persistence,
    topics: Mutex<HashMap<String, Topic>>,
    appended: Notify,
}

impl Broker {
    /// Buffered notifications per channel before slow subscribers start
    /// losing the oldest ones.
    pub const CHANNEL_CAPACITY: usize = 1024;

    pub fn new(persistence: Persistence) -> Self {
        Self {
            persistence,
            topics: Mutex::new(HashMap::new()),
            appended: Notify::new(),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Persistence::open(path)?))
    }

    pub fn temporary() -> Result<Self> {
        Ok(Self::new(Persistence::temporary()?))
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Topic::subscriber_count)
    }
}

#[async_trait]
impl LogBroker for Broker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, log_key: &str, message: &Message, id: Option<RecordId>) -> Result<RecordId> {
        let record_id = self.persistence.append(log_key, message, id)?;
        debug!(log_key, record_id = %record_id, "appended record");
        self.appended.notify_waiters();
        Ok(record_id)
    }

    async fn read_range(
        &self,
        log_key: &str,
        after: Option<RecordId>,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        // Register interest before reading so an append landing between the
        // read and the wait still wakes us.
        let notified = self.appended.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let records = self.persistence.read_after(log_key, after, max_count)?;
        if !records.is_empty() || block.is_zero() {
            return Ok(records);
        }

        let _ = tokio::time::timeout(block, notified).await;
        self.persistence.read_after(log_key, after, max_count)
    }

    async fn read_recent(&self, log_key: &str, count: usize) -> Result<Vec<LogRecord>> {
        self.persistence.read_recent(log_key, count)
    }

    async fn len(&self, log_key: &str) -> Result<usize> {
        self.persistence.len(log_key)
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        self.persistence.get_state(key)
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.persistence.set_state(key, value)
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<usize> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let reached = topics
            .get(channel)
            .map_or(0, |topic| topic.publish(message.clone()));
        debug!(channel, reached, "published notification");
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let rx = {
            let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics
                .entry(channel.to_string())
                .or_insert_with(|| Topic::new(channel, Self::CHANNEL_CAPACITY))
                .subscribe()
        };

        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |res| {
            let channel = channel.clone();
            async move {
                match res {
                    Ok(msg) => Some(msg),
                    Err(e) => {
                        warn!(channel = %channel, "subscriber fell behind: {e}");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
