//! Sync daemon
//!
//! Keeps the local and remote logs eventually consistent. Each direction is
//! a small state machine:
//!
//! - `Disconnected`: both buses are re-resolved, at most once per retry
//!   delay; success moves the direction to `Syncing`
//! - `Syncing`: read a batch after the cursor, append every record to the
//!   other log under its original id, advance the cursor. Any error moves
//!   the direction back to `Disconnected`
//!
//! A duplicate id on the target counts as replicated, which makes replaying a
//! batch harmless. Both cursors are persisted together after every pass that
//! moved one of them, and once more when the daemon stops.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::message::RecordId;
use crate::client::resolver::{ConnectionResolver, Connector, Endpoint};
use crate::client::MessageBus;
use crate::config::{Settings, SyncSettings};
use crate::sync::state::SyncState;
use crate::utils::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "local → remote"),
            Direction::RemoteToLocal => write!(f, "remote → local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// `retry_at: None` means the next pass may try right away.
    Disconnected { retry_at: Option<Instant> },
    Syncing,
}

#[derive(Debug)]
struct Replicator {
    direction: Direction,
    state: ReplicaState,
    cursor: Option<RecordId>,
}

impl Replicator {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: ReplicaState::Disconnected { retry_at: None },
            cursor: None,
        }
    }

    /// One step of the state machine. Returns how many records were copied.
    async fn step(&mut self, source: &MessageBus, target: &MessageBus, settings: &SyncSettings) -> usize {
        match self.state {
            ReplicaState::Disconnected { retry_at } => {
                if retry_at.is_some_and(|at| Instant::now() < at) {
                    return 0;
                }
                match tokio::try_join!(source.reconnect(), target.reconnect()) {
                    Ok(_) => {
                        info!(direction = %self.direction, "syncing");
                        self.state = ReplicaState::Syncing;
                    }
                    Err(e) => {
                        debug!(direction = %self.direction, "still disconnected: {e}");
                        self.disconnect(settings);
                        return 0;
                    }
                }
                self.replicate(source, target, settings).await
            }
            ReplicaState::Syncing => self.replicate(source, target, settings).await,
        }
    }

    async fn replicate(&mut self, source: &MessageBus, target: &MessageBus, settings: &SyncSettings) -> usize {
        match self.copy_batch(source, target, settings).await {
            Ok(copied) => copied,
            Err((copied, e)) => {
                warn!(direction = %self.direction, "sync failed: {e}");
                self.disconnect(settings);
                copied
            }
        }
    }

    async fn copy_batch(
        &mut self,
        source: &MessageBus,
        target: &MessageBus,
        settings: &SyncSettings,
    ) -> std::result::Result<usize, (usize, Error)> {
        let records = source
            .records_after(self.cursor, settings.batch_size, settings.block())
            .await
            .map_err(|e| (0, e))?;

        let mut copied = 0;
        for record in &records {
            let added = target.replicate(record).await.map_err(|e| (copied, e))?;
            if added {
                debug!(direction = %self.direction, record_id = %record.id, "replicated");
            }
            self.cursor = Some(record.id);
            copied += 1;
        }

        if copied > 0 {
            info!(direction = %self.direction, "synced {copied} records");
        }
        Ok(copied)
    }

    fn disconnect(&mut self, settings: &SyncSettings) {
        self.state = ReplicaState::Disconnected {
            retry_at: Some(Instant::now() + settings.retry_delay()),
        };
    }
}

/// Stops a running daemon from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

pub struct SyncDaemon {
    local: MessageBus,
    remote: Option<MessageBus>,
    settings: SyncSettings,
    outbound: Replicator,
    inbound: Replicator,
    state_loaded: bool,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl SyncDaemon {
    /// `remote: None` is local-only mode: nothing is replicated and both
    /// directions stay disconnected.
    pub fn new(local: MessageBus, remote: Option<MessageBus>, settings: SyncSettings) -> Self {
        Self {
            local,
            remote,
            settings,
            outbound: Replicator::new(Direction::LocalToRemote),
            inbound: Replicator::new(Direction::RemoteToLocal),
            state_loaded: false,
            running: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// One bus per endpoint: the daemon never fails over between them.
    pub fn from_settings(settings: &Settings, connector: Arc<dyn Connector>) -> Self {
        let probe_timeout = settings.bus.probe_timeout();
        let bus_for = |endpoint: Endpoint| {
            let resolver = ConnectionResolver::new(vec![endpoint], connector.clone(), probe_timeout);
            MessageBus::new(settings.bus.clone(), resolver)
        };

        let local = bus_for(settings.local_endpoint());
        let remote = settings.remote_endpoint().map(bus_for);
        Self::new(local, remote, settings.sync.clone())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
            wake: self.wake.clone(),
        }
    }

    pub fn state(&self, direction: Direction) -> ReplicaState {
        match direction {
            Direction::LocalToRemote => self.outbound.state,
            Direction::RemoteToLocal => self.inbound.state,
        }
    }

    pub fn cursors(&self) -> SyncState {
        SyncState {
            local_last_id: self.outbound.cursor,
            remote_last_id: self.inbound.cursor,
            last_sync_timestamp: None,
        }
    }

    /// Restore both cursors from the local broker. A missing blob starts both
    /// directions from the beginning.
    pub async fn load_state(&mut self) -> Result<()> {
        let blob = self.local.load_state(&self.settings.state_key).await?;
        let state = match blob {
            Some(blob) => SyncState::decode(&blob)?,
            None => SyncState::default(),
        };
        info!(
            local = ?state.local_last_id,
            remote = ?state.remote_last_id,
            "loaded sync state"
        );
        self.outbound.cursor = state.local_last_id;
        self.inbound.cursor = state.remote_last_id;
        self.state_loaded = true;
        Ok(())
    }

    /// Write both cursors in one blob. Failure is logged, not returned: the
    /// next successful write catches up.
    pub async fn persist_state(&self) {
        let state = SyncState::new(self.outbound.cursor, self.inbound.cursor);
        let stored = match state.encode() {
            Ok(blob) => self.local.store_state(&self.settings.state_key, &blob).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            warn!(
                "{}",
                Error::PersistenceFailure(format!("could not save sync state: {e}"))
            );
        }
    }

    /// Step both directions once, concurrently. Returns the number of records
    /// copied each way.
    pub async fn sync_pass(&mut self) -> (usize, usize) {
        if !self.state_loaded {
            if let Err(e) = self.load_state().await {
                warn!("sync state unavailable, skipping pass: {e}");
                return (0, 0);
            }
        }

        let Some(remote) = self.remote.as_ref() else {
            return (0, 0);
        };

        let before = (self.outbound.cursor, self.inbound.cursor);
        let (outbound, inbound) = tokio::join!(
            self.outbound.step(&self.local, remote, &self.settings),
            self.inbound.step(remote, &self.local, &self.settings),
        );

        if (self.outbound.cursor, self.inbound.cursor) != before {
            self.persist_state().await;
        }
        (outbound, inbound)
    }

    /// Run passes every sync interval until stopped, then persist the cursors.
    /// A stop requested before `run` makes it return after the final save.
    pub async fn run(&mut self) {
        info!(interval_ms = self.settings.interval_ms, "sync daemon started");
        if self.remote.is_none() {
            warn!("no remote endpoint configured, running local-only");
        }

        while self.running.load(Ordering::SeqCst) {
            self.sync_pass().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval()) => {}
                _ = self.wake.notified() => {}
            }
        }

        if self.state_loaded {
            self.persist_state().await;
        }
        info!("sync daemon stopped");
    }
}
