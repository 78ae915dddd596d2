//! The `broker` module holds the log/notification capability the messaging
//! core is built on.
//!
//! `LogBroker` is the seam: an ordered durable log (append, ranged read,
//! recent read), a small keyed state area, and fire-and-forget channels.
//! `engine::Broker` implements it in-process on top of `sled`; the transport
//! module implements it over WebSocket for brokers living elsewhere.

pub mod engine;
pub mod message;
pub mod topic;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::Result;
use message::{LogRecord, Message, RecordId};

pub use engine::Broker;

/// Live notifications for one channel. The stream ends when the link to the
/// broker is gone.
pub type MessageStream = BoxStream<'static, Message>;

#[async_trait]
pub trait LogBroker: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<()>;

    /// Append to `log_key`. With `id` the record keeps that id, and an id the
    /// log already holds yields `Error::DuplicateRecord`.
    async fn append(&self, log_key: &str, message: &Message, id: Option<RecordId>) -> Result<RecordId>;

    /// Up to `max_count` records strictly after `after`, oldest first. When
    /// nothing is available, waits at most `block` for new appends.
    async fn read_range(
        &self,
        log_key: &str,
        after: Option<RecordId>,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>>;

    /// The last `count` records, most recent first.
    async fn read_recent(&self, log_key: &str, count: usize) -> Result<Vec<LogRecord>>;

    async fn len(&self, log_key: &str) -> Result<usize>;

    async fn get_state(&self, key: &str) -> Result<Option<String>>;

    async fn set_state(&self, key: &str, value: &str) -> Result<()>;

    /// Broadcast to current subscribers of `channel`; returns how many there
    /// were.
    async fn publish(&self, channel: &str, message: &Message) -> Result<usize>;

    /// Messages published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream>;
}
