//! The `persistence` module provides the on-disk pieces of a broker and of
//! the bus fallback.
//!
//! - `sled_store`: the durable, ordered log (one `sled` tree per log key) plus
//!   a small keyed state area used for sync cursors.
//! - `overflow`: the append-only JSON Lines journal written when a message
//!   cannot reach every broker.

pub mod overflow;
pub mod sled_store;

pub use overflow::OverflowStore;
pub use sled_store::Persistence;

#[cfg(test)]
mod tests;
