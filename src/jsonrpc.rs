//! JSON-RPC 2.0 plumbing shared by the session and the transports.
//!
//! Request ids are generated per session; responses are checked against the
//! request they answer before their payload is handed upward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::types::{JsonRpcError, JsonRpcResponse, RequestId, JSON_RPC_VERSION};

/// Thread-safe request ID generator using atomic counter.
///
/// IDs start at 1 and increment monotonically.
#[derive(Debug, Clone)]
pub struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl RequestIdGenerator {
    /// Create a new request ID generator with numeric IDs starting at 1.
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Generate the next request ID.
    pub fn next_id(&self) -> RequestId {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        RequestId::Number(counter as i64)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A response envelope that cannot be trusted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("response id {actual} does not match request id {expected}")]
    IdMismatch { expected: RequestId, actual: RequestId },

    #[error("unsupported jsonrpc version '{0}'")]
    Version(String),

    #[error("response carries neither result nor error")]
    Empty,

    #[error("response carries both result and error")]
    Ambiguous,
}

/// The two legitimate outcomes of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The method succeeded with this result.
    Result(Value),
    /// The server answered with a JSON-RPC error object.
    Error(JsonRpcError),
}

/// Validate `response` as the answer to `expected` and split it into its
/// result or error.
pub fn unpack_response(
    expected: &RequestId,
    response: JsonRpcResponse,
) -> Result<Reply, EnvelopeError> {
    if response.jsonrpc != JSON_RPC_VERSION {
        return Err(EnvelopeError::Version(response.jsonrpc));
    }
    if !expected.matches(&response.id) {
        return Err(EnvelopeError::IdMismatch {
            expected: expected.clone(),
            actual: response.id,
        });
    }

    match (response.result, response.error) {
        (Some(_), Some(_)) => Err(EnvelopeError::Ambiguous),
        (Some(result), None) => Ok(Reply::Result(result)),
        (None, Some(error)) => Ok(Reply::Error(error)),
        (None, None) => Err(EnvelopeError::Empty),
    }
}
