pub mod client;
pub mod connector;
pub mod pool;

pub use client::{callback, ClientConfig, FnCallback, RpcClient, ASYNC_KEY, SYNC_KEY};
pub use connector::{AddressListFactory, ConnectorConfig};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PooledConnection};
pub use tagrpc_common::transport::Callback;
pub use tagrpc_common::{FromValue, RemoteError, Result, RpcError, Value};
