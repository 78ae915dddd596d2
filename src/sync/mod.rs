//! Bidirectional replication between the local and the remote log.

pub mod daemon;
pub mod state;

pub use daemon::{Direction, ReplicaState, StopHandle, SyncDaemon};
pub use state::SyncState;

#[cfg(test)]
mod tests;
