//! Watchdog behaviour seen from the client: stalled reads and overdue
//! asynchronous replies close the connection, idle connections survive.

use std::time::{Duration, Instant};

use tagrpc::client::{callback, ClientConfig, ConnectorConfig, RpcClient, ASYNC_KEY, SYNC_KEY};
use tagrpc::common::transport::{Connection, ConnectionConfig};
use tagrpc::server::{MethodTable, RpcServer, ServerConfig};
use tagrpc::{RpcError, Value, ValueType};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const STALL_MS: u64 = 300;

fn impatient() -> ClientConfig {
    ClientConfig {
        connector: ConnectorConfig {
            connect_timeout_ms: 2_000,
            connection: ConnectionConfig {
                stall_timeout_ms: STALL_MS,
                warning_period_ms: 100,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Completes the handshake on every connection, then never answers.
async fn silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(conn) = Connection::open(stream, "silent", &[], ConnectionConfig::default()).await {
                open.push(conn);
            }
        }
    });
    format!("localhost:{port}")
}

#[tokio::test]
async fn test_silent_server_fails_sync_call() {
    let client = RpcClient::connect(&silent_server().await, impatient()).unwrap();

    let started = Instant::now();
    let err = client.invoke("anything", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed(_)), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(STALL_MS));
    assert!(started.elapsed() < Duration::from_secs(5));
    // the dead connection is not pooled
    assert_eq!(client.pool().idle(SYNC_KEY), 0);
}

#[tokio::test]
async fn test_overdue_async_reply_fails_callback() {
    let client = RpcClient::connect(&silent_server().await, impatient()).unwrap();
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
    client.invoke_async("anything", vec![], cb).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(RpcError::ConnectionClosed(_))), "got {outcome:?}");
}

#[tokio::test]
async fn test_idle_async_connection_survives() {
    let methods = MethodTable::new("Echo").method("echo", &[ValueType::Any], |mut args| {
        Ok(args.pop().unwrap_or_default())
    });
    let server = RpcServer::bind(methods, ServerConfig::default())
        .await
        .unwrap()
        .spawn();
    let client = RpcClient::connect(server.connection_string(), impatient()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for round in 0..2 {
        let tx = tx.clone();
        let cb = callback(
            move |value| {
                let _ = tx.send(value);
            },
            |error| panic!("unexpected failure: {error}"),
        );
        client
            .invoke_async("echo", vec![Value::Int(round)], cb)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Value::Int(round)));

        // idle for longer than the stall timeout
        tokio::time::sleep(Duration::from_millis(STALL_MS * 2)).await;
    }

    assert_eq!(server.accepted(), 1);
    assert_eq!(client.pool().idle(ASYNC_KEY), 1);
}
