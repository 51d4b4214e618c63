//! Connection string parsing.
//!
//! A connection string lists one or more endpoints separated by commas:
//! `host1:port1,host2:port2`. A bare number is a port. An empty host or
//! `localhost` is a wildcard: servers bind every interface and clients
//! connect over loopback.

use std::fmt;

use crate::protocol::error::{Result, RpcError};

/// One `host:port` entry of a connection string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Option<String>,
    port: u16,
}

impl Endpoint {
    /// Endpoint on the wildcard host.
    pub fn wildcard(port: u16) -> Self {
        Self { host: None, port }
    }

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
            Self::wildcard(port)
        } else {
            Self {
                host: Some(host),
                port,
            }
        }
    }

    /// Parses a single entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` when the port is missing or not a number.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        let (host, port) = match entry.rsplit_once(':') {
            Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
            None => ("", entry),
        };
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|e| RpcError::InvalidAddress(format!("'{entry}': {e}")))?;
        Ok(Self::new(host.trim(), port))
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.host.is_none()
    }

    /// Address a client dials.
    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or("127.0.0.1"), self.port)
    }

    /// Address a server binds.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or("0.0.0.0"), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.as_deref().unwrap_or("localhost"), self.port)
    }
}

/// Parses a comma separated connection string.
///
/// # Errors
///
/// Returns `InvalidAddress` when the string has no entries or any entry is
/// malformed.
///
/// # Example
///
/// ```
/// use tagrpc_common::transport::parse_connection_string;
///
/// let endpoints = parse_connection_string("localhost:4000, example.org:4001").unwrap();
/// assert_eq!(endpoints.len(), 2);
/// assert!(endpoints[0].is_wildcard());
/// assert_eq!(endpoints[1].connect_addr(), "example.org:4001");
/// ```
pub fn parse_connection_string(s: &str) -> Result<Vec<Endpoint>> {
    let endpoints = s
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(Endpoint::parse)
        .collect::<Result<Vec<_>>>()?;
    if endpoints.is_empty() {
        return Err(RpcError::InvalidAddress(format!("'{s}' lists no endpoints")));
    }
    Ok(endpoints)
}
