//! tagrpc server
//!
//! This crate exposes a [`MethodTable`] over TCP. Each accepted connection is
//! served on its own task; calls are resolved by name and argument count,
//! their arguments coerced to the declared types, and the result or relayed
//! error written back under the call's sequence number.

pub mod provider;
pub mod server;

pub use provider::{Handler, Method, MethodResult, MethodTable, Resolved};
pub use server::{RpcServer, ServerConfig, ServerHandle, NAME_HEADER};
