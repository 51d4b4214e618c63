use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tagrpc_common::codec::Pojo;
use tagrpc_common::protocol::error::{Result, RpcError};
use tagrpc_common::transport::{Connection, ConnectionConfig, Endpoint, ReadMode};
use tagrpc_common::{Call, RemoteError, Reply, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::provider::{MethodResult, MethodTable, Resolved};

/// Server configuration.
///
/// # Default Configuration
///
/// - `bind`: `localhost:0` (every interface, any free port)
/// - `name`: `tagrpc`, sent to clients in the handshake header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Endpoint in connection string form. Port 0 picks a free port.
    pub bind: String,
    pub name: String,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "localhost:0".to_string(),
            name: "tagrpc".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

/// Header key carrying the server name.
pub const NAME_HEADER: &str = "name";

/// RPC server.
///
/// Accepts connections and serves each one on its own task: read a call,
/// resolve it against the [`MethodTable`], run it and write the reply.
/// Calls on one connection are served in order.
///
/// # Example
///
/// ```no_run
/// use tagrpc_common::{Value, ValueType};
/// use tagrpc_server::{MethodTable, RpcServer, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> tagrpc_common::Result<()> {
/// let methods = MethodTable::new("Echo")
///     .method("echo", &[ValueType::Any], |args| Ok(args.into_iter().next().unwrap_or_default()));
/// let server = RpcServer::bind(methods, ServerConfig::default()).await?;
/// println!("listening on {}", server.connection_string());
/// server.run().await
/// # }
/// ```
pub struct RpcServer {
    listener: TcpListener,
    methods: Arc<MethodTable>,
    config: ServerConfig,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accepted: Arc<AtomicUsize>,
}

impl RpcServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// - `InvalidAddress` when `config.bind` does not parse
    /// - `Io` when the address cannot be bound
    pub async fn bind(methods: MethodTable, config: ServerConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.bind)?;
        let listener = TcpListener::bind(endpoint.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(server = %config.name, addr = %local_addr, "listening");
        Ok(Self {
            listener,
            methods: Arc::new(methods),
            config,
            local_addr,
            shutdown: CancellationToken::new(),
            accepted: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Connection string clients can use to reach this server.
    pub fn connection_string(&self) -> String {
        let ip = self.local_addr.ip();
        let endpoint = if ip.is_unspecified() {
            Endpoint::wildcard(self.port())
        } else {
            Endpoint::new(ip.to_string(), self.port())
        };
        endpoint.to_string()
    }

    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.methods
    }

    /// Accepts connections until shut down.
    pub async fn run(self) -> Result<()> {
        let header = vec![(NAME_HEADER.to_string(), Value::from(self.config.name.as_str()))];
        let header = Arc::new(header);
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!(server = %self.config.name, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            self.accepted.fetch_add(1, Ordering::Relaxed);
            let session = Session {
                methods: Arc::clone(&self.methods),
                shutdown: self.shutdown.child_token(),
                hooks: Vec::new(),
            };
            let name = format!("{}<-{peer}", self.config.name);
            let header = Arc::clone(&header);
            let config = self.config.connection.clone();
            tokio::spawn(async move {
                session.run(stream, name, &header, config).await;
            });
        }
        tracing::info!(server = %self.config.name, "stopped");
        Ok(())
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> ServerHandle {
        let local_addr = self.local_addr;
        let connection_string = self.connection_string();
        let shutdown = self.shutdown.clone();
        let accepted = Arc::clone(&self.accepted);
        ServerHandle {
            local_addr,
            connection_string,
            shutdown,
            accepted,
            task: Some(tokio::spawn(self.run())),
        }
    }
}

/// Handle to a server started with [`RpcServer::spawn`].
///
/// Dropping the handle shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    connection_string: String,
    shutdown: CancellationToken,
    accepted: Arc<AtomicUsize>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Shuts down and waits for the accept loop to exit.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| RpcError::ConnectionClosed(format!("server task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State of one served connection.
struct Session {
    methods: Arc<MethodTable>,
    shutdown: CancellationToken,
    /// Disconnect hooks queued on this connection, deduplicated.
    hooks: Vec<Resolved>,
}

impl Session {
    async fn run(mut self, stream: TcpStream, name: String, header: &[(String, Value)], config: ConnectionConfig) {
        let conn = match Connection::open(stream, name, header, config).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!(error = %e, "handshake with client failed");
                return;
            }
        };

        loop {
            let call = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                call = conn.read_frame(ReadMode::Idle, Call::read) => call,
            };
            let call = match call {
                Ok(call) => call,
                Err(RpcError::EndOfStream) | Err(RpcError::ConnectionClosed(_)) => break,
                Err(e) => {
                    tracing::warn!(connection = %conn.name(), error = %e, "dropping connection");
                    break;
                }
            };
            if let Err(e) = self.dispatch(&conn, call).await {
                tracing::debug!(connection = %conn.name(), error = %e, "reply failed");
                break;
            }
        }

        conn.close();
        self.run_hooks(conn.name()).await;
    }

    /// Serves one call. Errors mean the connection is unusable.
    async fn dispatch(&mut self, conn: &Connection, call: Call) -> Result<()> {
        let sequence = call.sequence;
        let method = call.method;
        tracing::debug!(connection = %conn.name(), method = %method, sequence, "call");

        let outcome = match self.methods.resolve(&method, call.args) {
            Ok(resolved) if self.is_hook(&resolved) => {
                if !self.hooks.iter().any(|queued| queued.same_call(&resolved)) {
                    self.hooks.push(resolved);
                }
                Ok(Value::Null)
            }
            Ok(resolved) => invoke(&self.methods, resolved).await,
            Err(e) => Err(RemoteError::from_error(&e).with_frame(format!("{}.{method}", self.methods.name()))),
        };
        let reply = match outcome {
            Ok(value) => Reply::success(sequence, value),
            Err(error) => Reply::failure(sequence, Value::Pojo(error.to_pojo())),
        };

        match conn.write_frame(|enc, buf| reply.write(enc, buf)).await {
            Err(e) if !e.is_fatal_to_connection() => {
                // the result itself could not be sent; report that instead
                let error = RemoteError::from_error(&e).with_frame(format!("{}.{method}", self.methods.name()));
                let fallback = Reply::failure(sequence, Value::Pojo(error.to_pojo()));
                conn.write_frame(|enc, buf| fallback.write(enc, buf)).await
            }
            written => written,
        }
    }

    fn is_hook(&self, resolved: &Resolved) -> bool {
        self.methods
            .get(resolved.index)
            .is_some_and(|m| m.is_disconnect_hook())
    }

    async fn run_hooks(&mut self, connection: &str) {
        for hook in std::mem::take(&mut self.hooks) {
            let method = self
                .methods
                .get(hook.index)
                .map(|m| m.name().to_string())
                .unwrap_or_default();
            if let Err(e) = invoke(&self.methods, hook).await {
                tracing::warn!(connection, method = %method, error = %e, "disconnect hook failed");
            }
        }
    }
}

/// Runs a provider method off the connection task, since providers may
/// block.
async fn invoke(methods: &Arc<MethodTable>, resolved: Resolved) -> MethodResult {
    let methods = Arc::clone(methods);
    tokio::task::spawn_blocking(move || methods.invoke(&resolved))
        .await
        .unwrap_or_else(|e| Err(RemoteError::new(RemoteError::PANIC, e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagrpc_common::ValueType;

    fn echo() -> MethodTable {
        MethodTable::new("Echo").method("echo", &[ValueType::Any], |args| {
            Ok(args.into_iter().next().unwrap_or_default())
        })
    }

    async fn call(conn: &Connection, call: Call) -> Reply {
        conn.write_frame(|enc, buf| call.write(enc, buf)).await.unwrap();
        conn.read_frame(ReadMode::Reply, Reply::read).await.unwrap()
    }

    #[tokio::test]
    async fn test_port_zero_picks_free_port() {
        let server = RpcServer::bind(echo(), ServerConfig::default()).await.unwrap();
        assert_ne!(server.port(), 0);
        assert_eq!(server.connection_string(), format!("localhost:{}", server.port()));
    }

    #[tokio::test]
    async fn test_explicit_host_kept_in_connection_string() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".into(),
            ..Default::default()
        };
        let server = RpcServer::bind(echo(), config).await.unwrap();
        assert_eq!(server.connection_string(), format!("127.0.0.1:{}", server.port()));
    }

    #[tokio::test]
    async fn test_bad_bind_address() {
        let config = ServerConfig {
            bind: "nowhere".into(),
            ..Default::default()
        };
        assert!(matches!(
            RpcServer::bind(echo(), config).await,
            Err(RpcError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_carries_server_name() {
        let config = ServerConfig {
            name: "echo-server".into(),
            ..Default::default()
        };
        let server = RpcServer::bind(echo(), config).await.unwrap().spawn();
        let conn = Connection::connect(
            &format!("127.0.0.1:{}", server.port()),
            "client",
            &[],
            ConnectionConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(conn.peer_header_value(NAME_HEADER), Some(&Value::from("echo-server")));

        let reply = call(&conn, Call::new(0, "echo", vec![Value::from("hi")])).await;
        assert_eq!(reply, Reply::success(0, Value::from("hi")));
        assert_eq!(server.accepted(), 1);
    }

    #[tokio::test]
    async fn test_async_sequence_echoed() {
        let server = RpcServer::bind(echo(), ServerConfig::default()).await.unwrap().spawn();
        let conn = Connection::connect(
            &format!("127.0.0.1:{}", server.port()),
            "client",
            &[],
            ConnectionConfig::default(),
        )
        .await
        .unwrap();
        let reply = call(&conn, Call::new(991, "echo", vec![Value::Int(4)])).await;
        assert_eq!(reply.sequence, 991);
        assert!(reply.success);
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_connection() {
        let server = RpcServer::bind(echo(), ServerConfig::default()).await.unwrap().spawn();
        let conn = Connection::connect(
            &format!("127.0.0.1:{}", server.port()),
            "client",
            &[],
            ConnectionConfig::default(),
        )
        .await
        .unwrap();

        let reply = call(&conn, Call::new(0, "missing", vec![])).await;
        assert!(!reply.success);
        let error = RemoteError::from_value(reply.value);
        assert_eq!(error.kind, RemoteError::METHOD_NOT_FOUND);
        assert_eq!(error.message, "missing/0");

        let reply = call(&conn, Call::new(0, "echo", vec![Value::Int(1)])).await;
        assert!(reply.success);
    }

    #[tokio::test]
    async fn test_oversize_result_reported_as_failure() {
        let methods = MethodTable::new("Big").method("blob", &[], |_| Ok(Value::Bytes(vec![7; 4096])));
        let config = ServerConfig {
            connection: ConnectionConfig {
                max_message_size: 1024,
                ..Default::default()
            },
            ..Default::default()
        };
        let server = RpcServer::bind(methods, config).await.unwrap().spawn();
        let conn = Connection::connect(
            &format!("127.0.0.1:{}", server.port()),
            "client",
            &[],
            ConnectionConfig::default(),
        )
        .await
        .unwrap();

        let reply = call(&conn, Call::new(0, "blob", vec![])).await;
        assert!(!reply.success);
        assert!(RemoteError::from_value(reply.value).message.contains("1024"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = RpcServer::bind(echo(), ServerConfig::default()).await.unwrap().spawn();
        server.stop().await.unwrap();
    }
}
