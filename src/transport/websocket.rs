//! WebSocket transport: server side
//!
//! Exposes an in-process `Broker` to remote `RemoteBroker` clients.
//! Responsibilities:
//! - accept TCP/WebSocket connections, one task per connection
//! - when a credential is configured, require an `auth` request first and
//!   drop connections that skip or fail it
//! - translate requests into `LogBroker` calls and answer with the request id
//! - forward channel notifications for every subscription the client opened
//!
//! Outgoing frames of a connection all go through one unbounded channel and a
//! dedicated send loop, so request handlers and subscription forwarders never
//! touch the socket directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::{Broker, LogBroker};
use crate::transport::message::{ClientRequest, Operation, Reply, ServerMessage};
use crate::utils::error::{Error, Result};

pub async fn start_websocket_server(
    listener: TcpListener,
    broker: Arc<Broker>,
    credential: Option<String>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("broker listening on ws://{addr}"),
        Err(e) => warn!("broker listening on unknown address: {e}"),
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };

        let broker = broker.clone();
        let credential = credential.clone();
        let client_id = format!("client-{}", uuid::Uuid::new_v4());
        debug!(%peer, client_id, "incoming connection");

        spawn(async move {
            handle_connection(stream, &client_id, broker, credential).await;
            info!(client_id, "disconnected");
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_id: &str,
    broker: Arc<Broker>,
    credential: Option<String>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    {
        let client_id = client_id.to_string();
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!(client_id, "send failed: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });
    }

    let mut authenticated = credential.is_none();
    let mut subscriptions: HashMap<u64, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(msg)) = ws_receiver.next().await {
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };

        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    client_id,
                    "invalid request: {e} | {}",
                    text.chars().take(100).collect::<String>()
                );
                reply(&tx, &ServerMessage::error(None, &Error::from(e)));
                continue;
            }
        };
        let id = request.id;

        match request.op {
            Operation::Auth { credential: given } => {
                if credential.as_deref().is_none_or(|expected| expected == given) {
                    authenticated = true;
                    debug!(client_id, "authenticated");
                    reply(&tx, &ServerMessage::Response { id, result: Reply::Done });
                } else {
                    warn!(client_id, "authentication failed");
                    reply(&tx, &ServerMessage::unauthorized(Some(id), "authentication failed"));
                    break;
                }
            }
            op if !authenticated => {
                warn!(client_id, op = op.name(), "request before authentication");
                reply(&tx, &ServerMessage::unauthorized(Some(id), "must authenticate first"));
                break;
            }
            Operation::Subscribe { channel } => match broker.subscribe(&channel).await {
                Ok(mut stream) => {
                    let tx_notify = tx.clone();
                    let forwarder = spawn(async move {
                        while let Some(message) = stream.next().await {
                            let note = ServerMessage::Notification {
                                subscription: id,
                                message,
                            };
                            if !reply(&tx_notify, &note) {
                                break;
                            }
                        }
                    });
                    subscriptions.insert(id, forwarder);
                    debug!(client_id, channel, subscription = id, "subscribed");
                    reply(&tx, &ServerMessage::Response { id, result: Reply::Done });
                }
                Err(e) => {
                    reply(&tx, &ServerMessage::error(Some(id), &e));
                }
            },
            Operation::Unsubscribe { subscription } => {
                if let Some(forwarder) = subscriptions.remove(&subscription) {
                    forwarder.abort();
                    debug!(client_id, subscription, "unsubscribed");
                }
                reply(&tx, &ServerMessage::Response { id, result: Reply::Done });
            }
            // Blocking reads must not hold up the rest of the connection.
            op @ Operation::ReadRange { .. } => {
                let broker = broker.clone();
                let tx = tx.clone();
                spawn(async move {
                    respond(&tx, id, execute(broker.as_ref(), op).await);
                });
            }
            op => {
                respond(&tx, id, execute(broker.as_ref(), op).await);
            }
        }
    }

    for (_, forwarder) in subscriptions {
        forwarder.abort();
    }
}

/// Run one data-plane operation against the broker.
async fn execute(broker: &Broker, op: Operation) -> Result<Reply> {
    let reply = match op {
        Operation::Ping => {
            broker.ping().await?;
            Reply::Done
        }
        Operation::Append {
            log_key,
            message,
            record_id,
        } => Reply::Appended(broker.append(&log_key, &message, record_id).await?),
        Operation::ReadRange {
            log_key,
            after,
            max_count,
            block_ms,
        } => Reply::Records(
            broker
                .read_range(&log_key, after, max_count, Duration::from_millis(block_ms))
                .await?,
        ),
        Operation::ReadRecent { log_key, count } => {
            Reply::Records(broker.read_recent(&log_key, count).await?)
        }
        Operation::Len { log_key } => Reply::Count(broker.len(&log_key).await?),
        Operation::GetState { key } => Reply::State(broker.get_state(&key).await?),
        Operation::SetState { key, value } => {
            broker.set_state(&key, &value).await?;
            Reply::Done
        }
        Operation::Publish { channel, message } => {
            Reply::Count(broker.publish(&channel, &message).await?)
        }
        Operation::Auth { .. } | Operation::Subscribe { .. } | Operation::Unsubscribe { .. } => {
            Reply::Done
        }
    };
    Ok(reply)
}

fn respond(tx: &UnboundedSender<WsMessage>, id: u64, result: Result<Reply>) {
    let msg = match result {
        Ok(result) => ServerMessage::Response { id, result },
        Err(e) => {
            debug!(request = id, "request failed: {e}");
            ServerMessage::error(Some(id), &e)
        }
    };
    reply(tx, &msg);
}

/// Queue a frame for the send loop. `false` once the connection is gone.
fn reply(tx: &UnboundedSender<WsMessage>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => tx.send(WsMessage::Text(text.into())).is_ok(),
        Err(e) => {
            error!("failed to encode server message: {e}");
            true
        }
    }
}
