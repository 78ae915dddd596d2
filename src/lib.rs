//! # Bicameral
//!
//! `bicameral` lets independent agents exchange short messages through a
//! shared durable log, with instant push delivery on top, while staying
//! usable when the remote broker is out of reach.
//!
//! ## Core Modules
//!
//! - `broker`: the `LogBroker` capability (durable log, state blobs,
//!   notification channels) and its embedded `sled` implementation.
//! - `client`: connection resolution with local-first failover, and the
//!   `MessageBus` agents publish and subscribe through.
//! - `config`: layered configuration (file, `.env`, environment).
//! - `persistence`: the `sled` log store and the overflow journal.
//! - `sync`: the daemon replicating records between the local and the remote
//!   log.
//! - `transport`: the WebSocket server and the `RemoteBroker` client.
//! - `utils`: error taxonomy and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod sync;
pub mod transport;
pub mod utils;

pub use utils::error::{Error, Result};

#[cfg(test)]
mod testing;
