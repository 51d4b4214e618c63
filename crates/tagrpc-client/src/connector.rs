use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tagrpc_common::protocol::error::{Result, RpcError};
use tagrpc_common::transport::{parse_connection_string, Connection, ConnectionConfig, Endpoint};
use tagrpc_common::Value;
use tokio::time::Instant;

use crate::pool::ConnectionFactory;

/// Settings for dialing a list of endpoints.
///
/// # Default Configuration
///
/// - `connect_timeout_ms`: 60000 (keep cycling through endpoints for a minute)
/// - `retry_pause_ms`: 2500 (pause after every endpoint failed once)
/// - `header`: empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub connect_timeout_ms: u64,
    pub retry_pause_ms: u64,
    /// Entries sent to the server in the handshake.
    pub header: BTreeMap<String, String>,
    pub connection: ConnectionConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            retry_pause_ms: 2_500,
            header: BTreeMap::new(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Connection factory that fails over across a list of endpoints.
///
/// Each attempt starts at the endpoint that last worked. On failure it moves
/// to the next one; once every endpoint has failed it pauses for
/// `retry_pause_ms` and starts another round, until `connect_timeout_ms`
/// has passed.
pub struct AddressListFactory {
    endpoints: Vec<Endpoint>,
    config: ConnectorConfig,
    last_address: AtomicUsize,
}

impl AddressListFactory {
    /// Builds a factory from a connection string such as
    /// `"host1:4000,host2:4000"`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` when the string does not parse.
    pub fn new(connection_string: &str, config: ConnectorConfig) -> Result<Self> {
        Ok(Self::from_endpoints(
            parse_connection_string(connection_string)?,
            config,
        ))
    }

    pub fn from_endpoints(endpoints: Vec<Endpoint>, config: ConnectorConfig) -> Self {
        Self {
            endpoints,
            config,
            last_address: AtomicUsize::new(0),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn header(&self) -> Vec<(String, Value)> {
        self.config
            .header
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect()
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        key: &str,
        header: &[(String, Value)],
        deadline: Instant,
    ) -> Result<Arc<Connection>> {
        let addr = endpoint.connect_addr();
        let connect = Connection::connect(&addr, key, header, self.config.connection.clone());
        match tokio::time::timeout_at(deadline, connect).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Connect(format!(
                "Timed out connecting to {addr}"
            ))),
        }
    }
}

#[async_trait]
impl ConnectionFactory for AddressListFactory {
    async fn create(&self, key: &str) -> Result<Arc<Connection>> {
        let count = self.endpoints.len();
        if count == 0 {
            return Err(RpcError::InvalidAddress("no endpoints configured".into()));
        }
        let header = self.header();
        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);
        let pause = Duration::from_millis(self.config.retry_pause_ms);
        let mut last_error = None;

        loop {
            for _ in 0..count {
                let index = self.last_address.load(Ordering::Relaxed) % count;
                let endpoint = &self.endpoints[index];
                match self.attempt(endpoint, key, &header, deadline).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        tracing::debug!(endpoint = %endpoint, error = %e, "connect attempt failed");
                        last_error = Some(e);
                        self.last_address.store((index + 1) % count, Ordering::Relaxed);
                    }
                }
                if Instant::now() >= deadline {
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tracing::warn!(
                endpoints = %self.describe(),
                pause_ms = self.config.retry_pause_ms,
                "all endpoints unreachable, retrying"
            );
            tokio::time::sleep(pause.min(deadline - now)).await;
        }

        Err(match last_error {
            Some(RpcError::Connect(msg)) => RpcError::Connect(msg),
            Some(other) => RpcError::Connect(other.to_string()),
            None => RpcError::Connect(format!("Timed out connecting to {}", self.describe())),
        })
    }

    fn describe(&self) -> String {
        self.endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}
