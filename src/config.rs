//! Session and server configuration.
//!
//! Servers are described by [`ServerConfig`], loaded from a JSON array file or
//! from `TOOLSESSION_*` environment variables (a `.env` file is honoured).
//! [`SessionConfig`] carries the client identity and the default time bound.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::transport::{HttpTransport, StdioTransport, Transport, TransportError};

/// Protocol versions the client can speak, most preferred first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

pub const ENV_COMMAND: &str = "TOOLSESSION_COMMAND";
pub const ENV_ARGS: &str = "TOOLSESSION_ARGS";
pub const ENV_URL: &str = "TOOLSESSION_URL";
pub const ENV_TIMEOUT_SECS: &str = "TOOLSESSION_TIMEOUT_SECS";

/// Errors raised while loading or applying configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid server config: {0}")]
    Invalid(String),

    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Failed to build transport: {0}")]
    Transport(#[from] TransportError),
}

/// Client-side settings for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Name reported to the server in `clientInfo`.
    pub client_name: String,
    pub client_version: String,
    /// Bound applied when an operation is given no timeout. `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// Versions offered in the handshake, most preferred first.
    pub protocol_versions: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            default_timeout: Some(Duration::from_secs(default_timeout())),
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl SessionConfig {
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The version sent in `initialize`.
    pub fn preferred_version(&self) -> Option<&str> {
        self.protocol_versions.first().map(String::as_str)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.protocol_versions.iter().any(|v| v == version)
    }
}

/// Type of server transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local process via stdio.
    #[default]
    Stdio,
    /// Remote HTTP endpoint.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

/// Authentication configuration for remote servers.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AuthConfig {
    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    /// Custom HTTP headers to include in requests.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// API key (for simple key-based auth).
    pub api_key: Option<String>,
    /// API key header name (default: "X-API-Key").
    pub api_key_header: Option<String>,
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Unique identifier for the server.
    pub id: String,
    /// Display name for the server.
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,

    // Stdio-specific fields
    /// Command to execute (for stdio transport).
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,

    // HTTP-specific fields
    /// URL endpoint for HTTP transport.
    pub url: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,

    /// Default operation timeout in seconds; 0 disables the bound.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl ServerConfig {
    /// Create a new stdio-based server configuration.
    pub fn new_stdio(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            working_dir: None,
            url: None,
            auth: AuthConfig::default(),
            timeout_secs: default_timeout(),
        }
    }

    /// Create a new HTTP-based server configuration.
    pub fn new_http(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport: TransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: Some(url.into()),
            auth: AuthConfig::default(),
            timeout_secs: default_timeout(),
        }
    }

    /// Read a server from `TOOLSESSION_*` variables, loading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a server from an arbitrary variable lookup.
    ///
    /// `TOOLSESSION_URL` selects the HTTP transport; otherwise
    /// `TOOLSESSION_COMMAND` is required and `TOOLSESSION_ARGS` is split on
    /// whitespace.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = if let Some(url) = non_empty(ENV_URL) {
            Self::new_http("env", "env", url)
        } else if let Some(command) = non_empty(ENV_COMMAND) {
            let args = non_empty(ENV_ARGS)
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            Self::new_stdio("env", "env", command, args)
        } else {
            return Err(ConfigError::Missing(format!(
                "set {} or {} to select a tool server",
                ENV_COMMAND, ENV_URL
            )));
        };

        if let Some(raw) = non_empty(ENV_TIMEOUT_SECS) {
            config.timeout_secs = raw.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a whole number, got '{}'", ENV_TIMEOUT_SECS, raw))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("Server ID cannot be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("Server name cannot be empty".to_string()));
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "Server '{}': stdio transport requires a command",
                        self.id
                    )));
                }
            }
            TransportKind::Http => {
                let url = self.url.as_deref().unwrap_or("").trim();
                if url.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Server '{}': http transport requires a URL",
                        self.id
                    )));
                }
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ConfigError::Invalid(format!("Invalid URL scheme: {}", url)));
                }
            }
        }

        Ok(())
    }

    /// The default bound for operations on this server.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    /// Session settings derived from this server's timeout.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_default_timeout(self.timeout())
    }

    /// Construct the transport this configuration describes.
    pub fn build_transport(&self) -> Result<Box<dyn Transport>, ConfigError> {
        self.validate()?;
        match self.transport {
            TransportKind::Stdio => {
                let command = self.command.clone().unwrap_or_default();
                let transport = StdioTransport::new(command, self.args.clone())
                    .with_env(self.env.clone())
                    .with_working_dir(self.working_dir.clone());
                Ok(Box::new(transport))
            }
            TransportKind::Http => {
                let url = self.url.clone().unwrap_or_default();
                Ok(Box::new(HttpTransport::new(url, &self.auth)?))
            }
        }
    }
}

/// Load and validate a JSON array of servers.
pub fn load_servers(path: impl AsRef<Path>) -> Result<Vec<ServerConfig>, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let servers: Vec<ServerConfig> =
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut seen = HashSet::new();
    for server in &servers {
        server.validate()?;
        if !seen.insert(server.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Duplicate server id '{}'",
                server.id
            )));
        }
    }

    debug!("Loaded {} server(s) from {}", servers.len(), path.display());
    Ok(servers)
}

/// Pick a server by id, or the only server when `id` is `None`.
pub fn select_server(servers: Vec<ServerConfig>, id: Option<&str>) -> Result<ServerConfig, ConfigError> {
    match id {
        Some(id) => servers
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ConfigError::Missing(format!("no server with id '{}'", id))),
        None => {
            let count = servers.len();
            let mut iter = servers.into_iter();
            match (iter.next(), count) {
                (Some(server), 1) => Ok(server),
                (None, _) => Err(ConfigError::Missing("config file lists no servers".to_string())),
                _ => Err(ConfigError::Missing(format!(
                    "config file lists {} servers; pick one with --id",
                    count
                ))),
            }
        }
    }
}
