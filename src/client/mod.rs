//! The `client` module is the agent-facing side of `bicameral`.
//!
//! - `resolver`: picks the broker to talk to from an ordered endpoint list,
//!   always preferring the highest-priority one that answers.
//! - `bus`: the `MessageBus` agents publish through and subscribe with,
//!   including the retry-once and overflow policies.

pub mod bus;
pub mod resolver;

pub use bus::{MessageBus, Subscription};
pub use resolver::{Connection, ConnectionResolver, Connector, Endpoint};
