//! Transport layer abstractions.
//!
//! A transport moves JSON-RPC envelopes between the session and a remote
//! tool server. Framing (stdio lines, HTTP bodies) is entirely its concern:
//! - [`StdioTransport`]: a local server spawned as a child process
//! - [`HttpTransport`]: a remote server reached by HTTP POST
//!
//! A session owns exactly one transport and never shares it.

use std::fmt;

use async_trait::async_trait;

use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

pub mod http;
pub mod stdio;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

// ============================================================================
// Transport Error Types
// ============================================================================

/// Errors specific to transport operations.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The connection could not be established.
    Connect(String),
    /// An operation was attempted before `connect` or after `disconnect`.
    NotConnected,
    /// The peer went away (EOF, process exit). The connection is unusable.
    Disconnected(String),
    /// I/O error on an otherwise live connection.
    Io(String),
    /// HTTP error status.
    Http { status: u16, message: String },
    /// The peer sent bytes that do not decode as a JSON-RPC message.
    Malformed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(msg) => write!(f, "Failed to connect: {}", msg),
            TransportError::NotConnected => write!(f, "Transport not connected"),
            TransportError::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
            TransportError::Io(msg) => write!(f, "I/O error: {}", msg),
            TransportError::Http { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            TransportError::Malformed(msg) => write!(f, "Malformed message: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// Create a connect error from any error type.
    pub fn connect<E: fmt::Display>(err: E) -> Self {
        TransportError::Connect(err.to_string())
    }

    /// Create an I/O error.
    pub fn io<E: fmt::Display>(err: E) -> Self {
        TransportError::Io(err.to_string())
    }

    /// Create a malformed-message error.
    pub fn malformed<E: fmt::Display>(err: E) -> Self {
        TransportError::Malformed(err.to_string())
    }

    /// Whether the connection cannot be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected(_) | TransportError::Malformed(_)
        )
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// A connection to a remote tool server.
///
/// All methods take `&self`: `disconnect` may be called while a `send` is
/// still pending, and implementations must tolerate that.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the underlying connection. A no-op when already connected.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send one request and wait for the response carrying its id.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Send a notification; no response is expected.
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError>;

    /// Tell the server a request was abandoned.
    async fn cancel(&self, request_id: RequestId) -> Result<(), TransportError> {
        self.notify(JsonRpcNotification::cancelled(&request_id, "request timed out"))
            .await
    }

    /// Release the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Whether the transport believes the connection is usable.
    async fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::Http {
                status: 503,
                message: "unavailable".to_string()
            }
            .to_string(),
            "HTTP error 503: unavailable"
        );
        assert_eq!(TransportError::NotConnected.to_string(), "Transport not connected");
    }

    #[test]
    fn test_transport_error_is_fatal() {
        assert!(TransportError::Disconnected("eof".to_string()).is_fatal());
        assert!(TransportError::Malformed("x".to_string()).is_fatal());
        assert!(!TransportError::Io("reset".to_string()).is_fatal());
        assert!(!TransportError::Connect("refused".to_string()).is_fatal());
        assert!(!TransportError::NotConnected.is_fatal());
    }
}
