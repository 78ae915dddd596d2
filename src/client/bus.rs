//! Message bus
//!
//! Publishes agent messages to the durable log and the notification
//! channels of whichever broker the resolver picked, and reads them back
//! either as history or as a live subscription.
//!
//! Failure policy:
//! - every broker call is attempted once on the current connection; on a
//!   connection error the resolver is invoked again and the call is retried
//!   exactly once, then the error goes back to the caller
//! - a message whose append failed is written to the overflow journal and
//!   the failure is still returned
//! - while any configured endpoint other than the connected one is
//!   unreachable the bus is *degraded*, and successful publishes are
//!   journaled as well; reachability is re-checked on every publish
//! - journal writes run on the blocking pool

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::message::{LogRecord, Message, RecordId};
use crate::broker::{LogBroker, MessageStream};
use crate::client::resolver::{Connection, ConnectionResolver, Endpoint};
use crate::config::BusSettings;
use crate::persistence::OverflowStore;
use crate::utils::error::{Error, Result};

pub struct MessageBus {
    settings: BusSettings,
    resolver: Arc<ConnectionResolver>,
    overflow: OverflowStore,
    connection: RwLock<Option<Connection>>,
    degraded: AtomicBool,
}

impl MessageBus {
    /// Nothing is contacted until the first operation or `reconnect`.
    pub fn new(settings: BusSettings, resolver: ConnectionResolver) -> Self {
        let overflow = OverflowStore::new(&settings.overflow_path);
        Self {
            settings,
            resolver: Arc::new(resolver),
            overflow,
            connection: RwLock::new(None),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn agent(&self) -> &str {
        &self.settings.agent
    }

    pub fn overflow(&self) -> &OverflowStore {
        &self.overflow
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Endpoint of the live connection, if any.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.connection
            .read()
            .await
            .as_ref()
            .map(|c| c.endpoint.clone())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Resolve from the top of the endpoint list and replace the current
    /// connection.
    pub async fn reconnect(&self) -> Result<Connection> {
        let conn = match self.resolver.resolve().await {
            Ok(conn) => conn,
            Err(e) => {
                *self.connection.write().await = None;
                return Err(e);
            }
        };

        self.refresh_degraded(&conn.endpoint).await;
        *self.connection.write().await = Some(conn.clone());
        Ok(conn)
    }

    /// Probe every endpoint other than `connected` and record whether any of
    /// them is out of reach.
    async fn refresh_degraded(&self, connected: &Endpoint) -> bool {
        let others: Vec<&Endpoint> = self
            .resolver
            .endpoints()
            .iter()
            .filter(|e| *e != connected)
            .collect();
        let reachable = join_all(others.iter().map(|e| self.resolver.probe(e))).await;
        let degraded = reachable.iter().any(|up| !up);

        let was = self.degraded.swap(degraded, Ordering::SeqCst);
        if degraded && !was {
            warn!(endpoint = %connected, "running degraded: not every endpoint is reachable");
        } else if !degraded && was {
            info!(endpoint = %connected, "every endpoint reachable again");
        }
        degraded
    }

    async fn current(&self) -> Result<Connection> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }
        self.reconnect().await
    }

    async fn invalidate(&self) {
        *self.connection.write().await = None;
    }

    /// Run `op` against the current broker; on a connection error re-resolve
    /// and run it one more time.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn LogBroker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = match self.current().await {
            Ok(conn) => op(conn.broker).await,
            Err(e) => Err(e),
        };

        match first {
            Err(e) if e.is_connection_error() => {
                warn!("broker call failed, re-resolving: {e}");
                self.invalidate().await;
                let conn = self.reconnect().await?;
                let second = op(conn.broker).await;
                if matches!(&second, Err(e) if e.is_connection_error()) {
                    self.invalidate().await;
                }
                second
            }
            other => other,
        }
    }

    /// Build a message from this bus's agent and publish it.
    pub async fn send(&self, to: &str, kind: &str, content: &str) -> Result<RecordId> {
        let message = Message::new(self.agent(), to, kind, content)?;
        self.publish(&message).await
    }

    /// Append `message` to the log, then notify the realtime channel and the
    /// sender/recipient channel.
    pub async fn publish(&self, message: &Message) -> Result<RecordId> {
        let log_key = self.settings.log_key.as_str();

        let record_id = match self
            .with_retry(|broker| async move { broker.append(log_key, message, None).await })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(message_id = message.id(), "failed to publish message: {e}");
                self.spill(message).await;
                return Err(e);
            }
        };

        let directed = message.directed_channel();
        for channel in [self.settings.realtime_channel.as_str(), directed.as_str()] {
            let notified = self
                .with_retry(|broker| async move { broker.publish(channel, message).await })
                .await;
            match notified {
                Ok(reached) => debug!(channel, reached, "notified subscribers"),
                Err(e) => warn!(channel, record_id = %record_id, "notification failed: {e}"),
            }
        }

        let degraded = match self.endpoint().await {
            Some(connected) => self.refresh_degraded(&connected).await,
            None => self.is_degraded(),
        };
        if degraded {
            self.spill(message).await;
        }

        info!(
            record_id = %record_id,
            to = message.recipient(),
            kind = message.kind(),
            "sent message"
        );
        Ok(record_id)
    }

    async fn spill(&self, message: &Message) {
        let overflow = self.overflow.clone();
        let queued = message.clone();
        let written = tokio::task::spawn_blocking(move || overflow.push(&queued))
            .await
            .unwrap_or_else(|e| Err(Error::PersistenceFailure(format!("overflow writer failed: {e}"))));
        match written {
            Ok(()) => warn!(
                path = %self.overflow.path().display(),
                message_id = message.id(),
                "message saved to overflow"
            ),
            Err(e) => error!(
                "{}",
                Error::PersistenceFailure(format!("overflow write failed: {e}"))
            ),
        }
    }

    /// Live messages for this agent that `predicate` accepts. Only messages
    /// published after this call returns are seen.
    pub async fn subscribe<F>(&self, predicate: F) -> Result<Subscription>
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let channel = self.settings.realtime_channel.as_str();
        let stream = self
            .with_retry(|broker| async move { broker.subscribe(channel).await })
            .await?;

        info!(agent = self.agent(), channel, "listening for messages");
        Ok(Subscription {
            agent: self.settings.agent.clone(),
            channel: channel.to_string(),
            stream,
            predicate: Box::new(predicate),
            resolver: self.resolver.clone(),
            wait: self.settings.poll_interval(),
        })
    }

    /// The last `count` messages, most recent first.
    pub async fn history(&self, count: usize) -> Result<Vec<Message>> {
        let log_key = self.settings.log_key.as_str();
        let records = self
            .with_retry(|broker| async move { broker.read_recent(log_key, count).await })
            .await?;
        Ok(records.into_iter().map(|r| r.message).collect())
    }

    pub async fn len(&self) -> Result<usize> {
        let log_key = self.settings.log_key.as_str();
        self.with_retry(|broker| async move { broker.len(log_key).await })
            .await
    }

    /// Records strictly after `after`, waiting up to `block` when none are
    /// available yet.
    pub async fn records_after(
        &self,
        after: Option<RecordId>,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        let log_key = self.settings.log_key.as_str();
        self.with_retry(|broker| async move {
            broker.read_range(log_key, after, max_count, block).await
        })
        .await
    }

    /// Append a record under its original id. Returns `false` when the log
    /// already had it, which is not an error.
    pub async fn replicate(&self, record: &LogRecord) -> Result<bool> {
        let log_key = self.settings.log_key.as_str();
        let result = self
            .with_retry(|broker| async move {
                broker
                    .append(log_key, &record.message, Some(record.id))
                    .await
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(Error::DuplicateRecord(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn load_state(&self, key: &str) -> Result<Option<String>> {
        self.with_retry(|broker| async move { broker.get_state(key).await })
            .await
    }

    pub async fn store_state(&self, key: &str, value: &str) -> Result<()> {
        self.with_retry(|broker| async move { broker.set_state(key, value).await })
            .await
    }
}

/// A live feed of messages addressed to one agent.
///
/// Not restartable: after `ConnectionLost` the caller subscribes again and
/// reads anything it missed from history.
pub struct Subscription {
    agent: String,
    channel: String,
    stream: MessageStream,
    predicate: Box<dyn Fn(&Message) -> bool + Send + Sync>,
    resolver: Arc<ConnectionResolver>,
    wait: Duration,
}

impl Subscription {
    /// Addressed to us (or everyone), not written by us, and accepted by the
    /// caller's predicate.
    pub fn accepts(&self, message: &Message) -> bool {
        message.is_addressed_to(&self.agent)
            && message.sender() != self.agent
            && (self.predicate)(message)
    }

    /// Wait up to the poll interval for the next accepted message.
    /// `Ok(None)` means nothing arrived in time.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        let deadline = Instant::now() + self.wait;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Ok(None),
                Ok(Some(message)) => {
                    if self.accepts(&message) {
                        return Ok(Some(message));
                    }
                }
                Ok(None) => {
                    self.resubscribe().await?;
                    return Ok(None);
                }
            }
        }
    }

    async fn resubscribe(&mut self) -> Result<()> {
        warn!(channel = %self.channel, "subscription dropped, re-resolving");
        let conn = self
            .resolver
            .resolve()
            .await
            .map_err(|e| Error::ConnectionLost(format!("resubscribe failed: {e}")))?;
        self.stream = conn
            .broker
            .subscribe(&self.channel)
            .await
            .map_err(|e| Error::ConnectionLost(format!("resubscribe failed: {e}")))?;
        info!(endpoint = %conn.endpoint, channel = %self.channel, "resubscribed");
        Ok(())
    }
}
