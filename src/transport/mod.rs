//! The `transport` module carries the `LogBroker` capability over WebSocket.
//!
//! - `message`: the JSON request/response/notification protocol.
//! - `websocket`: the server loop exposing an in-process `Broker`.
//! - `remote`: `RemoteBroker`, the client half, and `WsConnector`, which the
//!   connection resolver uses to reach configured endpoints.

pub mod message;
pub mod remote;
pub mod websocket;

pub use remote::{RemoteBroker, WsConnector};
pub use websocket::start_websocket_server;
