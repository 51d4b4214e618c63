// Integration tests for tagrpc-server
//
// These tests start a real server on a free port and drive it through the
// pooled client.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tagrpc_client::{callback, remote_interface, ClientConfig, PoolConfig, RpcClient, RpcError};
use tagrpc_common::{RemoteError, Value, ValueType};
use tagrpc_server::{MethodTable, RpcServer, ServerConfig, ServerHandle};
use tokio::sync::mpsc;

// ============================================================================
// Test Helpers
// ============================================================================

fn calculator(released: Arc<Mutex<Vec<String>>>) -> MethodTable {
    MethodTable::new("Calculator")
        .method("add", &[ValueType::Int, ValueType::Int], |args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(Value::Int(sum as i32))
        })
        .method("check", &[ValueType::Int], |args| match args[0].as_i64() {
            Some(n) if n >= 0 => Ok(Value::Bool(true)),
            _ => Err(RemoteError::new("IllegalArgumentException", "bad")),
        })
        .method("sleep", &[ValueType::Long], |args| {
            let ms = args[0].as_i64().unwrap_or_default();
            std::thread::sleep(Duration::from_millis(ms as u64));
            Ok(Value::Long(ms))
        })
        .disconnect_hook("release", &[ValueType::String], {
            let released = Arc::clone(&released);
            move |args| {
                let name = args[0].as_str().unwrap_or_default().to_string();
                released.lock().unwrap().push(name);
                Ok(Value::Null)
            }
        })
        .disconnect_hook("forget", &[ValueType::Double], move |args| {
            released.lock().unwrap().push(format!("forget {}", args[0]));
            Ok(Value::Null)
        })
}

async fn start() -> (ServerHandle, Arc<Mutex<Vec<String>>>) {
    let released = Arc::new(Mutex::new(Vec::new()));
    let server = RpcServer::bind(calculator(Arc::clone(&released)), ServerConfig::default())
        .await
        .unwrap()
        .spawn();
    (server, released)
}

fn client(server: &ServerHandle) -> RpcClient {
    RpcClient::connect(server.connection_string(), ClientConfig::default()).unwrap()
}

remote_interface! {
    struct Calculator {
        fn add(a: i32, b: i32) -> i64;
        fn check(n: i32) -> bool;
        fn add_three(a: i32, b: i32, c: i32) -> i64 as "add";
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_add_through_stub() {
    let (server, _) = start().await;
    let calc = Calculator::new(client(&server));
    // the Int result widens to the declared return type
    assert_eq!(calc.add(2, 3).await.unwrap(), 5);
}

#[tokio::test]
async fn test_wrong_arity_is_method_not_found() {
    let (server, _) = start().await;
    let calc = Calculator::new(client(&server));
    let err = calc.add_three(2, 3, 4).await.unwrap_err();
    assert!(matches!(err, RpcError::MethodNotFound(m) if m == "add/3"));
    // the connection is still good
    assert_eq!(calc.add(1, 1).await.unwrap(), 2);
}

#[tokio::test]
async fn test_provider_error_relayed_with_remote_frame() {
    let (server, _) = start().await;
    let calc = Calculator::new(client(&server));
    let err = calc.check(-1).await.unwrap_err();
    let RpcError::Remote(remote) = err else {
        panic!("expected a remote error, got {err:?}");
    };
    assert_eq!(remote.kind, "IllegalArgumentException");
    assert_eq!(remote.message, "bad");
    assert_eq!(remote.stack[0], "Calculator.check");
    assert_eq!(
        remote.stack[1],
        format!("~ call to server ~.call(127.0.0.1:{})", server.port())
    );
    assert!(remote.stack[2].ends_with(".invoke(check)"));
}

#[tokio::test]
async fn test_arguments_coerced_from_strings() {
    let (server, _) = start().await;
    let client = client(&server);
    let sum = client
        .invoke("add", vec![Value::from("40"), Value::Long(2)])
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(42));

    let err = client
        .invoke("add", vec![Value::from("forty"), Value::Int(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(ref r) if r.kind == "IllegalArgument"));
}

// ============================================================================
// Asynchronous calls
// ============================================================================

#[tokio::test]
async fn test_async_results_reach_their_callbacks() {
    let (server, _) = start().await;
    let client = client(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..10 {
        let tx = tx.clone();
        let err_tx = tx.clone();
        let cb = callback(
            move |value| {
                let _ = tx.send((i, Ok(value)));
            },
            move |error| {
                let _ = err_tx.send((i, Err(error.to_string())));
            },
        );
        client
            .invoke_async("add", vec![Value::Int(i), Value::Int(100)], cb)
            .await
            .unwrap();
    }
    drop(tx);

    let mut seen = Vec::new();
    while let Some((i, outcome)) = rx.recv().await {
        assert_eq!(outcome, Ok(Value::Int(i + 100)));
        seen.push(i);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
}

// ============================================================================
// Disconnect hooks
// ============================================================================

#[tokio::test]
async fn test_disconnect_hooks_deduplicated_and_run_on_close() {
    let (server, released) = start().await;
    let client = client(&server);

    for name in ["a", "b", "a"] {
        let reply = client.invoke("release", vec![Value::from(name)]).await.unwrap();
        assert_eq!(reply, Value::Null);
    }
    assert!(released.lock().unwrap().is_empty());

    client.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while released.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*released.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_disconnect_hook_with_nan_argument_runs_once() {
    let (server, released) = start().await;
    let client = client(&server);

    for _ in 0..3 {
        client.invoke("forget", vec![Value::Double(f64::NAN)]).await.unwrap();
    }
    client.close();
    tokio::time::timeout(Duration::from_secs(5), async {
        while released.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(released.lock().unwrap().len(), 1);
}

// ============================================================================
// Pooling
// ============================================================================

#[tokio::test]
async fn test_concurrent_calls_respect_pool_bound() {
    let (server, _) = start().await;
    let config = ClientConfig {
        pool: PoolConfig {
            max_connections: 3,
            acquire_timeout_ms: 10_000,
        },
        ..Default::default()
    };
    let client = RpcClient::connect(server.connection_string(), config).unwrap();

    let calls = (0..16).map(|i| {
        let client = client.clone();
        async move { client.invoke_as::<i64>("sleep", vec![Value::Long(10 + i)]).await }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), 10 + i as i64);
    }
    assert!(server.accepted() <= 3);
    assert_eq!(client.pool().in_use(tagrpc_client::SYNC_KEY), 0);
}
