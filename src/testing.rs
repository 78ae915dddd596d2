//! Test doubles shared by the unit test modules.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::broker::message::{LogRecord, Message, RecordId};
use crate::broker::{Broker, LogBroker, MessageStream};
use crate::client::resolver::{Connector, ConnectionResolver, Endpoint};
use crate::client::MessageBus;
use crate::config::BusSettings;
use crate::utils::error::{Error, Result};

/// An in-process broker that can be switched off to simulate an outage.
#[derive(Clone)]
pub struct FlakyBroker {
    pub inner: Arc<Broker>,
    up: Arc<AtomicBool>,
    cuts: Arc<watch::Sender<u64>>,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Broker::temporary().expect("temporary broker")),
            up: Arc::new(AtomicBool::new(true)),
            cuts: Arc::new(watch::channel(0).0),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// End every stream handed out by `subscribe` so far, as a dropped
    /// server connection would.
    pub fn end_subscriptions(&self) {
        self.cuts.send_modify(|generation| *generation += 1);
    }

    fn check(&self) -> Result<()> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ConnectionLost("broker switched off".into()))
        }
    }
}

#[async_trait]
impl LogBroker for FlakyBroker {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn append(&self, log_key: &str, message: &Message, id: Option<RecordId>) -> Result<RecordId> {
        self.check()?;
        self.inner.append(log_key, message, id).await
    }

    async fn read_range(
        &self,
        log_key: &str,
        after: Option<RecordId>,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>> {
        self.check()?;
        self.inner.read_range(log_key, after, max_count, block).await
    }

    async fn read_recent(&self, log_key: &str, count: usize) -> Result<Vec<LogRecord>> {
        self.check()?;
        self.inner.read_recent(log_key, count).await
    }

    async fn len(&self, log_key: &str) -> Result<usize> {
        self.check()?;
        self.inner.len(log_key).await
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get_state(key).await
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set_state(key, value).await
    }

    async fn publish(&self, channel: &str, message: &Message) -> Result<usize> {
        self.check()?;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream> {
        self.check()?;
        let stream = self.inner.subscribe(channel).await?;
        let mut cut = self.cuts.subscribe();
        cut.borrow_and_update();
        Ok(stream
            .take_until(async move {
                let _ = cut.changed().await;
            })
            .boxed())
    }
}

/// Hands out `FlakyBroker`s by endpoint name.
#[derive(Default)]
pub struct StaticConnector {
    brokers: HashMap<String, FlakyBroker>,
}

impl StaticConnector {
    pub fn with(mut self, name: &str, broker: &FlakyBroker) -> Self {
        self.brokers.insert(name.to_string(), broker.clone());
        self
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn LogBroker>> {
        match self.brokers.get(&endpoint.name) {
            Some(broker) => Ok(Arc::new(broker.clone())),
            None => Err(Error::ConnectionLost(format!("nothing listening at {endpoint}"))),
        }
    }
}

pub fn endpoint(name: &str, priority: u8) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 7379 + u16::from(priority),
        credential: None,
        priority,
    }
}

pub fn bus_settings(agent: &str, dir: &Path) -> BusSettings {
    BusSettings {
        agent: agent.to_string(),
        log_key: "test:stream".to_string(),
        realtime_channel: "test:realtime".to_string(),
        overflow_path: dir.join(format!("{agent}-overflow.jsonl")),
        probe_timeout_ms: 200,
        poll_interval_ms: 200,
    }
}

pub fn resolver(connector: StaticConnector, names: &[&str]) -> ConnectionResolver {
    let endpoints = names
        .iter()
        .enumerate()
        .map(|(i, name)| endpoint(name, i as u8))
        .collect();
    ConnectionResolver::new(endpoints, Arc::new(connector), Duration::from_millis(200))
}

/// A bus for `agent` over the named brokers, tried in the given order.
pub fn bus(agent: &str, dir: &Path, brokers: &[(&str, &FlakyBroker)]) -> MessageBus {
    let connector = brokers
        .iter()
        .fold(StaticConnector::default(), |c, (name, broker)| c.with(name, broker));
    let names: Vec<&str> = brokers.iter().map(|(name, _)| *name).collect();
    MessageBus::new(bus_settings(agent, dir), resolver(connector, &names))
}
