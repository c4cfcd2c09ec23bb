//! Client sessions for remote tool servers.
//!
//! A [`ToolSession`] connects to a server speaking MCP-shaped JSON-RPC 2.0,
//! discovers the tools it offers, and invokes them with arguments checked
//! against each tool's declared schema.
//!
//! # Architecture
//!
//! - `session`: lifecycle, handshake, discovery, invocation
//! - `transport`: the `Transport` trait with stdio and HTTP implementations
//! - `types`: JSON-RPC envelopes and protocol payloads
//! - `jsonrpc`: request ids and response unpacking
//! - `schema`: argument validation against compiled JSON Schemas
//! - `tool`: descriptors, catalogs, invocation results
//! - `config`: session and server settings
//! - `events`: optional lifecycle events
//! - `error`: the `SessionError` taxonomy

pub mod config;
pub mod error;
pub mod events;
pub mod jsonrpc;
pub mod schema;
pub mod session;
pub mod tool;
pub mod transport;
pub mod types;

pub use config::{load_servers, select_server, AuthConfig, ConfigError, ServerConfig, SessionConfig, TransportKind};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use events::{EventEmitter, SessionEvent, SessionStatistics};
pub use schema::{ArgumentValidator, ValidationError};
pub use session::{SessionState, ToolSession};
pub use tool::{InvocationReport, InvocationRequest, InvocationResult, ToolCatalog, ToolDescriptor};
pub use transport::{HttpTransport, StdioTransport, Transport, TransportError};
