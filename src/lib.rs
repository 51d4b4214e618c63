//! tagrpc
//!
//! A lightweight RPC transport: a tagged binary wire codec with name
//! interning, framed TCP connections guarded by a watchdog, a pooled client
//! with address failover, and a server dispatching calls to a method table.
//!
//! This crate re-exports the workspace libraries:
//!
//! - [`common`] - values, codec and transport
//! - [`client`] - connection pool and client dispatch
//! - [`server`] - method tables and the accept loop
//!
//! # Example
//!
//! ```no_run
//! use tagrpc::client::{ClientConfig, RpcClient};
//! use tagrpc::server::{MethodTable, RpcServer, ServerConfig};
//! use tagrpc::{Value, ValueType};
//!
//! # #[tokio::main]
//! # async fn main() -> tagrpc::Result<()> {
//! let methods = MethodTable::new("Calculator").method(
//!     "add",
//!     &[ValueType::Long, ValueType::Long],
//!     |args| Ok(Value::Long(args.iter().filter_map(Value::as_i64).sum())),
//! );
//! let server = RpcServer::bind(methods, ServerConfig::default()).await?.spawn();
//!
//! let client = RpcClient::connect(server.connection_string(), ClientConfig::default())?;
//! let sum: i64 = client.invoke_as("add", vec![Value::Int(2), Value::Int(3)]).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

pub use tagrpc_client as client;
pub use tagrpc_common as common;
pub use tagrpc_server as server;

pub use tagrpc_common::{FromValue, PojoValue, RemoteError, Result, RpcError, Value, ValueType};
