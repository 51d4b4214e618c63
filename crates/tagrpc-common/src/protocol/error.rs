use thiserror::Error;

use super::remote::RemoteError;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Stream corrupted: {0}")]
    StreamCorrupted(String),

    #[error("Not serializable: {0}")]
    NotSerializable(String),

    #[error("End of stream: peer closed the connection")]
    EndOfStream,

    #[error("Connection {0} is closed")]
    ConnectionClosed(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    Remote(RemoteError),

    #[error("Unable to convert {from} to {to}")]
    Coercion { from: String, to: String },

    #[error("Timed out acquiring a connection after {0}ms")]
    PoolTimeout(u64),

    #[error("Connection pool {0} is closed")]
    PoolClosed(String),

    #[error("Message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether a connection that produced this error can no longer be trusted
    /// to carry frames.
    ///
    /// Serialization and message size failures are detected before anything
    /// reaches the socket, so the connection stays usable after them.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            RpcError::StreamCorrupted(_)
                | RpcError::EndOfStream
                | RpcError::ConnectionClosed(_)
                | RpcError::Io(_)
        )
    }

    /// Short kind name used when the error is relayed to a peer.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::StreamCorrupted(_) => "StreamCorrupted",
            RpcError::NotSerializable(_) => "NotSerializable",
            RpcError::EndOfStream => "EndOfStream",
            RpcError::ConnectionClosed(_) => "ConnectionClosed",
            RpcError::Connect(_) => "Connect",
            RpcError::InvalidAddress(_) => "InvalidAddress",
            RpcError::MethodNotFound(_) => RemoteError::METHOD_NOT_FOUND,
            RpcError::Remote(_) => "Remote",
            RpcError::Coercion { .. } => "IllegalArgument",
            RpcError::PoolTimeout(_) => "PoolTimeout",
            RpcError::PoolClosed(_) => "PoolClosed",
            RpcError::MessageTooLarge { .. } => "MessageTooLarge",
            RpcError::Io(_) => "Io",
        }
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidAddress(err.to_string())
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
