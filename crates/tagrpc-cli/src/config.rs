//! Configuration file and environment handling.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tagrpc_client::ClientConfig;
use tagrpc_server::ServerConfig;

/// Environment variable overriding the server bind address.
pub const BIND_ENV: &str = "TAGRPC_BIND";

/// Contents of a `--config` file. Every section and field is optional.
///
/// ```json
/// {
///   "server": { "bind": "localhost:4000", "name": "calc" },
///   "client": { "pool": { "max_connections": 8 } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl CliConfig {
    /// Loads a config file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Resolves the bind address: command line, then [`BIND_ENV`], then the
    /// config file.
    pub fn resolve_bind(&mut self, flag: Option<String>, env: Option<String>) {
        if let Some(bind) = flag.or(env).filter(|b| !b.trim().is_empty()) {
            self.server.bind = bind;
        }
    }
}
