//! Errors relayed between peers.
//!
//! A failure raised by a provider travels back to the caller as a
//! [`RemoteError`] record. The caller splices its own stack onto the remote
//! one so the full path of the call is visible in one place.

use std::fmt;

use crate::codec::descriptor::{FieldKind, Pojo, TypeDescriptor};

use super::error::{Result, RpcError};
use super::value::{PojoValue, Value};

/// Frame inserted between the remote and local parts of a spliced stack.
pub const SPLICE_MARKER: &str = "~ call to server ~";

/// A failure reported by the remote side of a call.
///
/// # Fields
///
/// - `kind`: short classification, e.g. `IllegalArgumentException`
/// - `message`: human readable detail
/// - `stack`: frames, innermost first
///
/// # Example
///
/// ```
/// use tagrpc_common::protocol::remote::RemoteError;
///
/// let err = RemoteError::new("IllegalArgumentException", "bad")
///     .with_frame("Calculator.add");
/// assert_eq!(err.to_string(), "IllegalArgumentException: bad");
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub stack: Vec<String>,
}

impl RemoteError {
    /// Record type name used on the wire.
    pub const TYPE_NAME: &'static str = "tagrpc.RemoteError";

    /// Kind reported when no provider method matches a call.
    pub const METHOD_NOT_FOUND: &'static str = "MethodNotFound";

    /// Kind reported when a provider panics.
    pub const PANIC: &'static str = "Panic";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Appends a frame to the stack.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.stack.push(frame.into());
        self
    }

    /// Builds the relayed form of a local error.
    pub fn from_error(err: &RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => remote.clone(),
            RpcError::MethodNotFound(method) => {
                Self::new(Self::METHOD_NOT_FOUND, method.clone())
            }
            other => Self::new(other.kind(), other.to_string()),
        }
    }

    /// Interprets a failure payload. Anything that is not a relayed error
    /// record is wrapped with its display form as the message.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Pojo(pojo) if pojo.type_name() == Self::TYPE_NAME => {
                Self::from_pojo(pojo).unwrap_or_default()
            }
            Value::String(message) => Self::new("Remote", message),
            other => Self::new("Remote", other.to_string()),
        }
    }

    /// Splices the caller's stack onto the remote one.
    ///
    /// The result is the remote frames, a marker naming the server, then
    /// `local` frames. A wildcard host is reported as `localhost`.
    pub fn splice(&mut self, host: &str, port: u16, local: &[String]) {
        let host = if host.is_empty() || host == "0.0.0.0" {
            "localhost"
        } else {
            host
        };
        self.stack
            .push(format!("{SPLICE_MARKER}.call({host}:{port})"));
        self.stack.extend(local.iter().cloned());
    }

    /// Converts into the error surfaced to a caller.
    pub fn into_rpc_error(self) -> RpcError {
        if self.kind == Self::METHOD_NOT_FOUND {
            RpcError::MethodNotFound(self.message)
        } else {
            RpcError::Remote(self)
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

impl Pojo for RemoteError {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(Self::TYPE_NAME)
            .with_field("kind", FieldKind::Object)
            .with_field("message", FieldKind::Object)
            .with_field("stack", FieldKind::Object)
    }

    fn to_pojo(&self) -> PojoValue {
        let stack = self.stack.iter().cloned().map(Value::String).collect();
        PojoValue::new(Self::TYPE_NAME)
            .with("kind", self.kind.as_str())
            .with("message", self.message.as_str())
            .with("stack", Value::List(stack))
    }

    fn from_pojo(mut pojo: PojoValue) -> Result<Self> {
        let text = |v: Option<Value>| match v {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let kind = text(pojo.take("kind"));
        let message = text(pojo.take("message"));
        let stack = match pojo.take("stack") {
            Some(Value::List(items)) | Some(Value::Array { items, .. }) => items
                .into_iter()
                .map(|frame| match frame {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            kind,
            message,
            stack,
        })
    }
}
