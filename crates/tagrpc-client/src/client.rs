use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tagrpc_common::protocol::error::{Result, RpcError};
use tagrpc_common::transport::{Callback, Connection, FrameReader, ReadMode};
use tagrpc_common::{Call, FromValue, RemoteError, Reply, Value, SYNC_SEQUENCE};

use crate::connector::{AddressListFactory, ConnectorConfig};
use crate::pool::{ConnectionPool, PoolConfig};

/// Pool key of connections carrying synchronous calls.
pub const SYNC_KEY: &str = "sync-tagrpc";

/// Pool key of connections carrying asynchronous calls. These connections
/// have a background reader routing replies to callbacks.
pub const ASYNC_KEY: &str = "async-tagrpc";

/// Client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub connector: ConnectorConfig,
}

/// Adapts a pair of closures to [`Callback`].
pub struct FnCallback<F, E> {
    on_value: F,
    on_error: E,
}

impl<F, E> Callback for FnCallback<F, E>
where
    F: Fn(Value) + Send + Sync,
    E: Fn(RpcError) + Send + Sync,
{
    fn on_callback(&self, value: Value) {
        (self.on_value)(value)
    }

    fn on_exception(&self, error: RpcError) {
        (self.on_error)(error)
    }
}

/// Builds a [`Callback`] from closures.
///
/// # Example
///
/// ```
/// use tagrpc_client::callback;
///
/// let cb = callback(
///     |value| println!("got {value}"),
///     |error| eprintln!("failed: {error}"),
/// );
/// ```
pub fn callback<F, E>(on_value: F, on_error: E) -> Arc<dyn Callback>
where
    F: Fn(tagrpc_common::Value) + Send + Sync + 'static,
    E: Fn(RpcError) + Send + Sync + 'static,
{
    Arc::new(FnCallback { on_value, on_error })
}

/// Turns a failure payload into the caller-facing error, splicing the
/// server address and the local call site onto the remote stack.
fn remote_failure(conn: &Connection, call_site: String, payload: Value) -> RpcError {
    let mut error = RemoteError::from_value(payload);
    let (host, port) = conn
        .peer_addr()
        .map(|addr| (addr.ip().to_string(), addr.port()))
        .unwrap_or_default();
    error.splice(&host, port, &[call_site]);
    error.into_rpc_error()
}

/// Background reader of asynchronous connections.
struct ReplyRouter {
    client: String,
}

#[async_trait]
impl FrameReader for ReplyRouter {
    async fn on_frame(&self, connection: &Arc<Connection>) -> Result<()> {
        let reply = connection.read_frame(ReadMode::Idle, Reply::read).await?;
        let Some(callback) = connection.remove_callback(reply.sequence) else {
            tracing::warn!(
                connection = %connection.name(),
                sequence = reply.sequence,
                "dropping reply for unknown sequence"
            );
            return Ok(());
        };
        if reply.success {
            callback.on_callback(reply.value);
        } else {
            let site = format!("{}.async#{}", self.client, reply.sequence);
            callback.on_exception(remote_failure(connection, site, reply.value));
        }
        Ok(())
    }
}

struct ClientInner {
    name: String,
    pool: Arc<ConnectionPool>,
    close_pool: bool,
    closed: AtomicBool,
}

/// RPC client dispatching calls over a connection pool.
///
/// Synchronous calls borrow a connection for the whole round trip.
/// Asynchronous calls only borrow one to send; replies arrive on the
/// connection's background reader and are delivered to the callback
/// registered under the call's sequence number.
///
/// Clones share the same pool.
///
/// # Example
///
/// ```no_run
/// use tagrpc_client::{ClientConfig, RpcClient};
/// use tagrpc_common::Value;
///
/// # #[tokio::main]
/// # async fn main() -> tagrpc_common::Result<()> {
/// let client = RpcClient::connect("localhost:4000", ClientConfig::default())?;
/// let sum: i32 = client.invoke_as("add", vec![Value::Int(2), Value::Int(3)]).await?;
/// assert_eq!(sum, 5);
/// client.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Creates a client with its own pool over the endpoints of
    /// `connection_string`. Closing the client closes the pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` when the connection string does not parse.
    pub fn connect(connection_string: &str, config: ClientConfig) -> Result<Self> {
        let factory = AddressListFactory::new(connection_string, config.connector)?;
        let pool = ConnectionPool::new(connection_string, Arc::new(factory), config.pool);
        Ok(Self::with_pool(connection_string, Arc::new(pool), true))
    }

    /// Creates a client over an existing pool.
    ///
    /// # Arguments
    ///
    /// * `name` - Name reported by [`RpcClient::name`]
    /// * `pool` - Pool to borrow connections from
    /// * `close_pool` - Whether [`RpcClient::close`] also closes the pool
    pub fn with_pool(name: impl Into<String>, pool: Arc<ConnectionPool>, close_pool: bool) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                name: name.into(),
                pool,
                close_pool,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.pool.is_closed()
    }

    /// Closes the client, and its pool when the client owns it.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.inner.close_pool {
            self.inner.pool.close();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Calls `method` and waits for its result.
    ///
    /// Dropping the returned future before it resolves closes the connection
    /// it was using.
    ///
    /// # Errors
    ///
    /// - `Remote` when the provider failed, with the stack spliced
    /// - `MethodNotFound` when the server has no matching method
    /// - transport and pool errors
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.ensure_open()?;
        let mut conn = self.inner.pool.lease(SYNC_KEY).await?;
        let result = self.call_sync(&conn, method, args).await;
        conn.complete();
        result
    }

    async fn call_sync(&self, conn: &Arc<Connection>, method: &str, args: Vec<Value>) -> Result<Value> {
        let call = Call::new(SYNC_SEQUENCE, method, args);
        conn.write_frame(|enc, buf| call.write(enc, buf)).await?;
        let reply = conn.read_frame(ReadMode::Reply, Reply::read_sync).await?;
        if reply.success {
            Ok(reply.value)
        } else {
            let site = format!("{}.invoke({method})", self.inner.name);
            Err(remote_failure(conn, site, reply.value))
        }
    }

    /// Calls `method` and converts the result.
    pub async fn invoke_as<T: FromValue>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        T::from_value(self.invoke(method, args).await?)
    }

    /// Sends `method` without waiting for the result, which is delivered to
    /// `callback` instead.
    ///
    /// # Errors
    ///
    /// Errors raised before the call could be sent are returned here and not
    /// reported to the callback. Everything after that, including the
    /// connection closing before the reply arrives, goes to
    /// [`Callback::on_exception`].
    pub async fn invoke_async(
        &self,
        method: &str,
        args: Vec<Value>,
        callback: Arc<dyn Callback>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.inner.pool.lease(ASYNC_KEY).await?;
        let result = self.send_async(&conn, method, args, callback).await;
        conn.complete();
        result
    }

    async fn send_async(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        args: Vec<Value>,
        callback: Arc<dyn Callback>,
    ) -> Result<()> {
        let sequence = conn.next_sequence();
        conn.add_callback(sequence, method, callback)?;
        conn.set_reader(Arc::new(ReplyRouter {
            client: self.inner.name.clone(),
        }));
        let call = Call::new(sequence, method, args);
        match conn.write_frame(|enc, buf| call.write(enc, buf)).await {
            Ok(()) => Ok(()),
            // still registered: the callback has not heard about this failure
            Err(e) if conn.remove_callback(sequence).is_some() => Err(e),
            Err(_) => Ok(()),
        }
    }
}

/// Generates a typed stub over an [`RpcClient`].
///
/// Each declared method forwards to [`RpcClient::invoke`] under its own name,
/// or under the name given after `as`, and converts the result with
/// [`FromValue`]. The stub also answers `name`, `is_closed` and `close`
/// locally.
///
/// # Example
///
/// ```no_run
/// use tagrpc_client::{remote_interface, ClientConfig, RpcClient};
///
/// remote_interface! {
///     pub struct Calculator {
///         fn add(a: i32, b: i32) -> i32;
///         fn describe(verbose: bool) -> String as "getDescription";
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> tagrpc_common::Result<()> {
/// let calc = Calculator::new(RpcClient::connect("localhost:4000", ClientConfig::default())?);
/// assert_eq!(calc.add(2, 3).await?, 5);
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! remote_interface {
    (@wire $method:ident) => {
        stringify!($method)
    };
    (@wire $method:ident $wire:literal) => {
        $wire
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                fn $method:ident ( $( $arg:ident : $argty:ty ),* $(,)? ) -> $ret:ty $(as $wire:literal)? ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $name {
            client: $crate::RpcClient,
        }

        impl $name {
            pub fn new(client: $crate::RpcClient) -> Self {
                Self { client }
            }

            pub fn client(&self) -> &$crate::RpcClient {
                &self.client
            }

            pub fn name(&self) -> &str {
                self.client.name()
            }

            pub fn is_closed(&self) -> bool {
                self.client.is_closed()
            }

            pub fn close(&self) {
                self.client.close()
            }

            $(
                $(#[$fmeta])*
                pub async fn $method(&self, $($arg: $argty),*) -> $crate::Result<$ret> {
                    let args: Vec<$crate::Value> = vec![$($crate::Value::from($arg)),*];
                    let value = self
                        .client
                        .invoke($crate::remote_interface!(@wire $method $($wire)?), args)
                        .await?;
                    <$ret as $crate::FromValue>::from_value(value)
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionFactory;
    use tagrpc_common::transport::ConnectionConfig;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Direct(String);

    #[async_trait]
    impl ConnectionFactory for Direct {
        async fn create(&self, key: &str) -> Result<Arc<Connection>> {
            Connection::connect(&self.0, key, &[], ConnectionConfig::default()).await
        }

        fn describe(&self) -> String {
            self.0.clone()
        }
    }

    /// Serves one connection, answering each call with the method name, or
    /// failing calls to "fail".
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let conn = Connection::open(stream, "echo", &[], ConnectionConfig::default())
                        .await
                        .unwrap();
                    while let Ok(call) = conn.read_frame(ReadMode::Idle, Call::read).await {
                        let reply = if call.method == "fail" {
                            let err = RemoteError::new("IllegalStateException", "nope")
                                .with_frame("Echo.fail");
                            Reply::failure(call.sequence, Value::Pojo(tagrpc_common::codec::Pojo::to_pojo(&err)))
                        } else {
                            Reply::success(call.sequence, Value::from(call.method.as_str()))
                        };
                        if conn.write_frame(|enc, buf| reply.write(enc, buf)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn client_for(addr: String) -> RpcClient {
        let pool = ConnectionPool::new("test", Arc::new(Direct(addr)), PoolConfig::default());
        RpcClient::with_pool("test", Arc::new(pool), true)
    }

    #[tokio::test]
    async fn test_invoke_returns_value() {
        let client = client_for(echo_server().await);
        assert_eq!(client.invoke("ping", vec![]).await.unwrap(), Value::from("ping"));
        let echoed: String = client.invoke_as("pong", vec![Value::Int(1)]).await.unwrap();
        assert_eq!(echoed, "pong");
        assert_eq!(client.pool().idle(SYNC_KEY), 1);
    }

    #[tokio::test]
    async fn test_remote_failure_is_spliced() {
        let client = client_for(echo_server().await);
        let err = client.invoke("fail", vec![]).await.unwrap_err();
        let RpcError::Remote(remote) = err else {
            panic!("expected a remote error, got {err:?}");
        };
        assert_eq!(remote.kind, "IllegalStateException");
        assert_eq!(remote.stack[0], "Echo.fail");
        assert!(remote.stack[1].starts_with("~ call to server ~.call(127.0.0.1:"));
        assert_eq!(remote.stack[2], "test.invoke(fail)");
        // the connection survives an application failure
        assert_eq!(client.pool().idle(SYNC_KEY), 1);
    }

    #[tokio::test]
    async fn test_async_reply_reaches_callback() {
        let client = client_for(echo_server().await);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let cb = callback(
            move |v| {
                let _ = tx.send(Ok(v));
            },
            move |e| {
                let _ = err_tx.send(Err(e.to_string()));
            },
        );
        client.invoke_async("later", vec![], Arc::clone(&cb)).await.unwrap();
        client.invoke_async("fail", vec![], cb).await.unwrap();

        let mut outcomes = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        outcomes.sort_by_key(|o| o.is_err());
        assert_eq!(outcomes[0], Ok(Value::from("later")));
        assert!(outcomes[1].as_ref().unwrap_err().contains("nope"));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let client = client_for(echo_server().await);
        client.invoke("warm", vec![]).await.unwrap();
        client.close();
        assert!(client.is_closed());
        assert!(client.pool().is_closed());
        assert!(matches!(
            client.invoke("ping", vec![]).await,
            Err(RpcError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_pool_survives_client_close() {
        let addr = echo_server().await;
        let pool = Arc::new(ConnectionPool::new("shared", Arc::new(Direct(addr)), PoolConfig::default()));
        let a = RpcClient::with_pool("a", Arc::clone(&pool), false);
        let b = RpcClient::with_pool("b", Arc::clone(&pool), false);
        a.close();
        assert!(a.is_closed());
        assert_eq!(b.invoke("still", vec![]).await.unwrap(), Value::from("still"));
    }

    remote_interface! {
        struct Echo {
            fn ping() -> String;
            fn renamed(n: i32) -> String as "otherName";
        }
    }

    #[tokio::test]
    async fn test_generated_stub() {
        let echo = Echo::new(client_for(echo_server().await));
        assert_eq!(echo.ping().await.unwrap(), "ping");
        assert_eq!(echo.renamed(3).await.unwrap(), "otherName");
        assert_eq!(echo.name(), "test");
        echo.close();
        assert!(echo.is_closed());
    }
}
