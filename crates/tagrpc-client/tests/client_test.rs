//! Client Integration Tests
//!
//! These tests drive [`RpcClient`] against a minimal in-process server that
//! speaks the frame protocol directly, and verify:
//! - synchronous calls over a pooled connection
//! - connection failover across a connection string
//! - concurrent calls sharing a bounded pool
//! - asynchronous replies delivered out of order
//! - pending callbacks failing when the server goes away
//! - a cancelled call giving its connection back to the pool

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tagrpc_client::{
    callback, Callback, ClientConfig, ConnectorConfig, PoolConfig, RpcClient, RpcError, Value,
    SYNC_KEY,
};
use tagrpc_common::transport::{Connection, ConnectionConfig, ReadMode};
use tagrpc_common::{Call, Reply};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Test server answering `sum`, `sleep` and `hangup`.
struct TestServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(Self::serve(stream));
            }
        });
        Self { port, accepted }
    }

    async fn serve(stream: tokio::net::TcpStream) {
        let header = vec![("name".to_string(), Value::from("test-server"))];
        let Ok(conn) = Connection::open(stream, "test-server", &header, ConnectionConfig::default()).await
        else {
            return;
        };
        while let Ok(call) = conn.read_frame(ReadMode::Idle, Call::read).await {
            let conn = Arc::clone(&conn);
            // each call answered on its own task so slow calls can be overtaken
            tokio::spawn(async move {
                let reply = match call.method.as_str() {
                    "sum" => Reply::success(
                        call.sequence,
                        Value::Long(call.args.iter().filter_map(Value::as_i64).sum()),
                    ),
                    "sleep" => {
                        let ms = call.args.first().and_then(Value::as_i64).unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                        Reply::success(call.sequence, Value::Long(ms))
                    }
                    "hangup" => {
                        conn.close();
                        return;
                    }
                    _ => Reply::failure(call.sequence, Value::from("unknown")),
                };
                let _ = conn.write_frame(|enc, buf| reply.write(enc, buf)).await;
            });
        }
    }

    fn connection_string(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

fn quick_config() -> ClientConfig {
    ClientConfig {
        pool: PoolConfig {
            max_connections: 2,
            acquire_timeout_ms: 5_000,
        },
        connector: ConnectorConfig {
            connect_timeout_ms: 2_000,
            retry_pause_ms: 50,
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn test_sync_call() {
    let server = TestServer::start().await;
    let client = RpcClient::connect(&server.connection_string(), quick_config()).unwrap();

    let total: i64 = client
        .invoke_as("sum", vec![Value::Int(1), Value::Int(2), Value::Long(3)])
        .await
        .unwrap();
    assert_eq!(total, 6);

    // the pooled connection is reused
    let again: i64 = client.invoke_as("sum", vec![Value::Int(4)]).await.unwrap();
    assert_eq!(again, 4);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    client.close();
}

#[tokio::test]
async fn test_failover_to_live_endpoint() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = TestServer::start().await;
    let conn_str = format!("localhost:{dead},{}", server.connection_string());
    let client = RpcClient::connect(&conn_str, quick_config()).unwrap();

    let total: i64 = client.invoke_as("sum", vec![Value::Int(5)]).await.unwrap();
    assert_eq!(total, 5);
}

#[tokio::test]
async fn test_concurrent_calls_share_bounded_pool() {
    let server = TestServer::start().await;
    let client = RpcClient::connect(&server.connection_string(), quick_config()).unwrap();

    let calls = (0..8).map(|i| {
        let client = client.clone();
        async move { client.invoke_as::<i64>("sleep", vec![Value::Int(20 + i)]).await }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), 20 + i as i64);
    }
    assert!(server.accepted.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_async_replies_out_of_order() {
    let server = TestServer::start().await;
    let client = RpcClient::connect(&server.connection_string(), quick_config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for ms in [300, 10] {
        let tx = tx.clone();
        let cb = callback(
            move |value| {
                let _ = tx.send(value);
            },
            |error| panic!("unexpected failure: {error}"),
        );
        client
            .invoke_async("sleep", vec![Value::Int(ms)], cb)
            .await
            .unwrap();
    }

    assert_eq!(rx.recv().await, Some(Value::Long(10)));
    assert_eq!(rx.recv().await, Some(Value::Long(300)));
}

#[tokio::test]
async fn test_pending_callback_fails_on_hangup() {
    let server = TestServer::start().await;
    let client = RpcClient::connect(&server.connection_string(), quick_config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let err_tx = tx.clone();

    let cb = callback(
        move |value| {
            let _ = tx.send(Ok(value));
        },
        move |error| {
            let _ = err_tx.send(Err(error));
        },
    );
    client.invoke_async("hangup", vec![], cb).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(RpcError::ConnectionClosed(_))));
}

#[tokio::test]
async fn test_cancelled_call_releases_connection() {
    let server = TestServer::start().await;
    let mut config = quick_config();
    config.pool = PoolConfig {
        max_connections: 1,
        acquire_timeout_ms: 500,
    };
    let client = RpcClient::connect(&server.connection_string(), config).unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        client.invoke("sleep", vec![Value::Long(200)]),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(client.pool().in_use(SYNC_KEY), 0);
    // the interrupted connection is not reused
    assert_eq!(client.pool().idle(SYNC_KEY), 0);

    let total: i64 = client.invoke_as("sum", vec![Value::Int(7)]).await.unwrap();
    assert_eq!(total, 7);
    assert_eq!(server.accepted.load(Ordering::SeqCst), 2);
}

struct Collect(mpsc::UnboundedSender<Result<Value, RpcError>>);

impl Callback for Collect {
    fn on_callback(&self, value: Value) {
        let _ = self.0.send(Ok(value));
    }

    fn on_exception(&self, error: RpcError) {
        let _ = self.0.send(Err(error));
    }
}

#[tokio::test]
async fn test_async_call_with_callback_type() {
    let server = TestServer::start().await;
    let client = RpcClient::connect(&server.connection_string(), quick_config()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .invoke_async("sum", vec![Value::Int(2), Value::Int(40)], Arc::new(Collect(tx)))
        .await
        .unwrap();
    assert!(matches!(rx.recv().await, Some(Ok(Value::Long(42)))));
}
