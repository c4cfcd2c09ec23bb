//! Error taxonomy surfaced by [`ToolSession`](crate::session::ToolSession).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::jsonrpc::EnvelopeError;
use crate::schema::ValidationError;
use crate::session::SessionState;
use crate::transport::TransportError;

/// Errors returned by session operations.
///
/// Local errors (`SessionClosed`, `SessionBusy`, `UnknownTool`,
/// `ArgumentValidation`) are raised before anything reaches the transport.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The transport is unavailable or dropped mid-call.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote endpoint sent something the session cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The operation is not valid in the session's current state.
    #[error("Session is {state}, cannot {operation}")]
    SessionClosed {
        state: SessionState,
        operation: String,
    },

    /// Another operation is already in flight on this session.
    #[error("Session is busy with another operation")]
    SessionBusy,

    /// The tool is absent from the last tool listing.
    #[error("Unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// The arguments do not satisfy the tool's input schema.
    #[error("Invalid arguments for '{tool}': {reason}")]
    ArgumentValidation {
        tool: String,
        #[source]
        reason: ValidationError,
    },

    /// The tool (or the method on the server) reported failure.
    #[error("Tool '{tool}' failed: {message}")]
    RemoteExecution {
        tool: String,
        /// JSON-RPC error code, when the failure came as an error object.
        code: Option<i32>,
        message: String,
        /// The raw error data or tool result, preserved for inspection.
        payload: Option<Value>,
    },

    /// The caller's time bound elapsed.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

impl SessionError {
    /// Create a connection error from any displayable error.
    pub fn connection<E: fmt::Display>(err: E) -> Self {
        SessionError::Connection(err.to_string())
    }

    /// Create a protocol error from any displayable error.
    pub fn protocol<E: fmt::Display>(err: E) -> Self {
        SessionError::Protocol(err.to_string())
    }

    /// The variant as a plain kind, for matching and reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) => ErrorKind::Connection,
            SessionError::Protocol(_) => ErrorKind::Protocol,
            SessionError::SessionClosed { .. } => ErrorKind::SessionClosed,
            SessionError::SessionBusy => ErrorKind::SessionBusy,
            SessionError::UnknownTool { .. } => ErrorKind::UnknownTool,
            SessionError::ArgumentValidation { .. } => ErrorKind::ArgumentValidation,
            SessionError::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            SessionError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether the error was raised locally, without any transport traffic.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SessionError::SessionClosed { .. }
                | SessionError::SessionBusy
                | SessionError::UnknownTool { .. }
                | SessionError::ArgumentValidation { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    /// The preserved remote payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            SessionError::RemoteExecution { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Malformed(msg) => SessionError::Protocol(msg),
            other => SessionError::Connection(other.to_string()),
        }
    }
}

impl From<EnvelopeError> for SessionError {
    fn from(err: EnvelopeError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// Flat classification of [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Protocol,
    SessionClosed,
    SessionBusy,
    UnknownTool,
    ArgumentValidation,
    RemoteExecution,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::ArgumentValidation => "argument_validation",
            ErrorKind::RemoteExecution => "remote_execution",
            ErrorKind::Timeout => "timeout",
        };
        write!(f, "{}", name)
    }
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
