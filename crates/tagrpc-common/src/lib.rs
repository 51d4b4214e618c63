//! tagrpc common types, codec and transport
//!
//! This crate provides the value model, the tagged binary wire codec and the
//! framed TCP transport shared by the tagrpc client and server.
//!
//! # Overview
//!
//! tagrpc is a lightweight RPC transport. Calls carry a sequence number, an
//! interned method name and an argument array; replies carry the sequence
//! number, a success flag and a value. Synchronous calls own their connection
//! for the round trip, asynchronous calls are matched to callbacks by
//! sequence number.
//!
//! - **Protocol Layer**: [`Value`], errors, coercion, call and reply bodies
//! - **Codec Layer**: one's-complement tags, name interning, record
//!   serialization with shadow descriptors
//! - **Transport Layer**: length-prefixed frames, handshake, watchdog
//!
//! # Components
//!
//! - [`protocol`] - value model and error types
//! - [`codec`] - binary encoding of values
//! - [`transport`] - connections and their watchdog
//!
//! # Example
//!
//! ```
//! use tagrpc_common::codec::WireCodec;
//! use tagrpc_common::{PojoValue, Value};
//!
//! let mut codec = WireCodec::new();
//! let point = Value::Pojo(PojoValue::new("geo.Point").with("x", 1).with("y", 2));
//! let bytes = codec.encode(&point).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), point);
//! ```

pub mod codec;
pub mod protocol;
pub mod transport;

pub use protocol::*;
