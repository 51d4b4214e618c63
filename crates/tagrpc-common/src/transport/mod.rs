//! Transport layer
//!
//! Framed TCP connections carrying the binary wire codec.
//!
//! # Components
//!
//! - **[`Connection`]**: handshaken connection with independent read and
//!   write halves, callback registry and background reader
//! - **[`registry`]**: process-wide watchdog closing stalled connections
//! - **[`frame`]**: frame layout and default limits
//! - **[`address`]**: connection string parsing
//!
//! # Wire Format
//!
//! ```text
//! [4-byte big-endian length, counting itself] [body] [padding to 256 bytes]
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tagrpc_common::transport::{Connection, ConnectionConfig, ReadMode};
//! use tagrpc_common::Value;
//!
//! # #[tokio::main]
//! # async fn main() -> tagrpc_common::Result<()> {
//! let header = vec![("name".to_string(), Value::from("client"))];
//! let conn = Connection::connect("127.0.0.1:4000", "client", &header, ConnectionConfig::default()).await?;
//! conn.write_frame(|enc, buf| enc.write_value(buf, &Value::from("ping"))).await?;
//! let reply = conn.read_frame(ReadMode::Reply, |dec, buf| dec.read_value(buf)).await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod connection;
pub mod frame;
pub mod registry;

pub use address::{parse_connection_string, Endpoint};
pub use connection::{
    clock_ms, Callback, Connection, ConnectionConfig, FrameReader, Header, ReadMode,
};
