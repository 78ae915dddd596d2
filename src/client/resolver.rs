//! Connection resolution
//!
//! Produces a live broker handle from an ordered list of candidate
//! endpoints. Resolution always starts again from the highest-priority
//! endpoint, so a local broker that comes back is preferred again on the
//! next call; nothing about earlier outcomes is remembered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::broker::LogBroker;
use crate::utils::error::{Error, Result};

/// A candidate broker location. Lower `priority` is tried first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub credential: Option<String>,
    pub priority: u8,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// Opens a handle to the broker behind an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn LogBroker>>;
}

/// A broker handle together with the endpoint it was obtained from.
#[derive(Clone)]
pub struct Connection {
    pub endpoint: Endpoint,
    pub broker: Arc<dyn LogBroker>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

pub struct ConnectionResolver {
    endpoints: Vec<Endpoint>,
    connector: Arc<dyn Connector>,
    probe_timeout: Duration,
}

impl ConnectionResolver {
    pub fn new(
        mut endpoints: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        probe_timeout: Duration,
    ) -> Self {
        endpoints.sort_by_key(|e| e.priority);
        Self {
            endpoints,
            connector,
            probe_timeout,
        }
    }

    /// Candidates in the order they are tried.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// The first endpoint, in priority order, that answers a ping within the
    /// probe timeout.
    pub async fn resolve(&self) -> Result<Connection> {
        for endpoint in &self.endpoints {
            match self.open(endpoint).await {
                Ok(broker) => {
                    info!(endpoint = %endpoint, "connected to broker");
                    return Ok(Connection {
                        endpoint: endpoint.clone(),
                        broker,
                    });
                }
                Err(e) => warn!(endpoint = %endpoint, "broker unreachable: {e}"),
            }
        }

        Err(Error::NoEndpointAvailable {
            tried: self.endpoints.len(),
        })
    }

    /// Single bounded liveness check.
    pub async fn probe(&self, endpoint: &Endpoint) -> bool {
        match self.open(endpoint).await {
            Ok(_) => true,
            Err(e) => {
                debug!(endpoint = %endpoint, "probe failed: {e}");
                false
            }
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn LogBroker>> {
        let attempt = async {
            let broker = self.connector.connect(endpoint).await?;
            broker.ping().await?;
            Ok::<_, Error>(broker)
        };

        tokio::time::timeout(self.probe_timeout, attempt)
            .await
            .map_err(|_| {
                Error::ConnectionLost(format!(
                    "no answer within {}ms",
                    self.probe_timeout.as_millis()
                ))
            })?
    }
}
