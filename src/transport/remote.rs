//! WebSocket transport: client side
//!
//! `RemoteBroker` implements `LogBroker` against a broker server. Requests
//! are multiplexed over one connection and matched to their responses by id.
//! When the connection goes away every pending request fails with
//! `ConnectionLost` and every subscription stream ends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::spawn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{LogRecord, Message, RecordId};
use crate::broker::{LogBroker, MessageStream};
use crate::client::resolver::{Connector, Endpoint};
use crate::transport::message::{ClientRequest, Operation, Reply, ServerMessage, into_error};
use crate::utils::error::{Error, Result};

/// Upper bound on a server answer, on top of any requested blocking time.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = HashMap<u64, oneshot::Sender<Result<Reply>>>;

/// State shared by the broker handle, its subscription streams and the
/// connection tasks. Dropping the last strong reference closes the socket.
struct Link {
    endpoint: String,
    outgoing: UnboundedSender<WsMessage>,
    pending: Mutex<Pending>,
    subscriptions: Mutex<HashMap<u64, UnboundedSender<Message>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Link {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, request: &ClientRequest) -> Result<()> {
        let text = serde_json::to_string(request)?;
        self.outgoing
            .send(WsMessage::Text(text.into()))
            .map_err(|_| Error::ConnectionLost(format!("{} closed", self.endpoint)))
    }

    async fn request(&self, op: Operation, block: Duration) -> Result<Reply> {
        let id = self.next_id();
        self.request_with_id(id, op, block).await
    }

    async fn request_with_id(&self, id: u64, op: Operation, block: Duration) -> Result<Reply> {
        let name = op.name();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ConnectionLost(format!("{} closed", self.endpoint)));
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.send(&ClientRequest { id, op }) {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT + block, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost(format!(
                "{} dropped during {name}",
                self.endpoint
            ))),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(Error::ConnectionLost(format!(
                    "{} did not answer {name}",
                    self.endpoint
                )))
            }
        }
    }

    fn dispatch(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Response { id, result } => self.complete(Some(id), Ok(result)),
            ServerMessage::Error {
                id,
                kind,
                message,
                record_id,
            } => self.complete(id, Err(into_error(kind, message, record_id))),
            ServerMessage::Notification {
                subscription,
                message,
            } => {
                let mut subscriptions = self
                    .subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let gone = subscriptions
                    .get(&subscription)
                    .is_some_and(|tx| tx.send(message).is_err());
                if gone {
                    subscriptions.remove(&subscription);
                }
            }
        }
    }

    fn complete(&self, id: Option<u64>, result: Result<Reply>) {
        let waiter = id.and_then(|id| {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id)
        });
        match (waiter, result) {
            (Some(tx), result) => {
                let _ = tx.send(result);
            }
            (None, Err(e)) => warn!(endpoint = %self.endpoint, "broker reported: {e}"),
            (None, Ok(_)) => debug!(endpoint = %self.endpoint, ?id, "response nobody waits for"),
        }
    }

    fn shut_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.outgoing.send(WsMessage::Close(None));
    }
}

pub struct RemoteBroker {
    link: Arc<Link>,
}

impl RemoteBroker {
    /// Open a connection to `endpoint` and authenticate when it carries a
    /// credential.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let url = endpoint.url();
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let link = Arc::new(Link {
            endpoint: endpoint.to_string(),
            outgoing: tx,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = msg.is_close();
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("send failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let weak: Weak<Link> = Arc::downgrade(&link);
        spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let Some(link) = weak.upgrade() else {
                    return;
                };
                let msg = match frame {
                    Ok(msg) if msg.is_text() => msg,
                    Ok(msg) if msg.is_close() => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(endpoint = %link.endpoint, "connection error: {e}");
                        break;
                    }
                };
                let Ok(text) = msg.to_text() else {
                    continue;
                };
                match serde_json::from_str::<ServerMessage>(text) {
                    Ok(server_msg) => link.dispatch(server_msg),
                    Err(e) => warn!(endpoint = %link.endpoint, "unreadable frame: {e}"),
                }
            }
            if let Some(link) = weak.upgrade() {
                debug!(endpoint = %link.endpoint, "connection closed");
                link.shut_down();
            }
        });

        let broker = Self { link };
        if let Some(credential) = &endpoint.credential {
            broker
                .link
                .request(
                    Operation::Auth {
                        credential: credential.clone(),
                    },
                    Duration::ZERO,
                )
                .await?;
        }
        Ok(broker)
    }

    async fn call(&self, op: Operation) -> Result<Reply> {
        self.link.request(op, Duration::ZERO).await
    }
}

fn unexpected(op: &str, reply: Reply) -> Error {
    Error::Rejected(format!("unexpected reply to {op}: {reply:?}"))
}

#[async_trait]
impl LogBroker for RemoteBroker {
    async fn ping(&self) -> Result<()> {
        match self.call(Operation::Ping).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    async fn append(&self, log_key: &str, message: &Message, id: Option<RecordId>) -> Result<RecordId> {
        let op = Operation::Append {
            log_key: log_key.to_string(),
            message: message.clone(),
            record_id: id,
        };
        match self.call(op).await? {
            Reply::Appended(record_id) => Ok(record_id),
            other => Err(unexpected("append", other)),
        }
    }

    async fn read_range(
        &self,
        log_key: &str,
        after: Option<RecordId>,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        let op = Operation::ReadRange {
            log_key: log_key.to_string(),
            after,
            max_count,
            block_ms: u64::try_from(block.as_millis()).unwrap_or(u64::MAX),
        };
        match self.link.request(op, block).await? {
            Reply::Records(records) => Ok(records),
            other => Err(unexpected("read_range", other)),
        }
    }

    async fn read_recent(&self, log_key: &str, count: usize) -> Result<Vec<LogRecord>> {
        let op = Operation::ReadRecent {
            log_key: log_key.to_string(),
            count,
        };
        match self.call(op).await? {
            Reply::Records(records) => Ok(records),
            other => Err(unexpected("read_recent", other)),
        }
    }

    async fn len(&self, log_key: &str) -> Result<usize> {
        let op = Operation::Len {
            log_key: log_key.to_string(),
        };
        match self.call(op).await? {
            Reply::Count(n) => Ok(n),
            other => Err(unexpected("len", other)),
        }
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let op = Operation::GetState {
            key: key.to_string(),
        };
        match self.call(op).await? {
            Reply::State(value) => Ok(value),
            other => Err(unexpected("get_state", other)),
        }
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let op = Operation::SetState {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.call(op).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected("set_state", other)),
        }
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<usize> {
        let op = Operation::Publish {
            channel: channel.to_string(),
            message: message.clone(),
        };
        match self.call(op).await? {
            Reply::Count(n) => Ok(n),
            other => Err(unexpected("publish", other)),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        let id = self.link.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        // registered first so nothing sent right after the ack is missed
        self.link
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let op = Operation::Subscribe {
            channel: channel.to_string(),
        };
        match self.link.request_with_id(id, op, Duration::ZERO).await {
            Ok(_) => Ok(Box::pin(RemoteStream {
                rx,
                subscription: id,
                link: self.link.clone(),
            })),
            Err(e) => {
                self.link
                    .subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(e)
            }
        }
    }
}

/// Notifications of one remote subscription. Dropping it unsubscribes.
struct RemoteStream {
    rx: UnboundedReceiver<Message>,
    subscription: u64,
    link: Arc<Link>,
}

impl Stream for RemoteStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.link
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.subscription);
        if !self.link.closed.load(Ordering::SeqCst) {
            let request = ClientRequest {
                id: self.link.next_id(),
                op: Operation::Unsubscribe {
                    subscription: self.subscription,
                },
            };
            let _ = self.link.send(&request);
        }
    }
}

/// Connects to brokers over WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn LogBroker>> {
        Ok(Arc::new(RemoteBroker::connect(endpoint).await?))
    }
}
