//! Session event types for visibility into lifecycle and tool traffic.
//!
//! Events are only produced when an emitter has been installed with
//! [`ToolSession::set_event_emitter`](crate::session::ToolSession::set_event_emitter).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Events emitted by a session during its operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SessionEvent {
    // Lifecycle events
    /// The handshake completed and the session is ready.
    SessionOpened {
        server_name: String,
        server_version: String,
        protocol_version: String,
    },

    /// The handshake failed.
    SessionOpenFailed { kind: ErrorKind, error: String },

    /// The session reached the closed state.
    SessionClosed { reason: String },

    // Tool discovery events
    /// A tool listing completed.
    ToolDiscoveryCompleted { tool_count: usize, duration_ms: u64 },

    /// A tool listing failed.
    ToolDiscoveryFailed { kind: ErrorKind, error: String },

    // Tool execution events
    /// A tool call passed validation and is being dispatched.
    ToolCallStarted { tool_name: String },

    /// A tool call returned a result.
    ToolCallCompleted { tool_name: String, duration_ms: u64 },

    /// A tool call failed, locally or remotely.
    ToolCallFailed {
        tool_name: String,
        kind: ErrorKind,
        error: String,
    },
}

impl SessionEvent {
    /// Get the event category for routing.
    pub fn category(&self) -> &'static str {
        match self {
            SessionEvent::SessionOpened { .. }
            | SessionEvent::SessionOpenFailed { .. }
            | SessionEvent::SessionClosed { .. } => "session.lifecycle",

            SessionEvent::ToolDiscoveryCompleted { .. }
            | SessionEvent::ToolDiscoveryFailed { .. } => "session.discovery",

            SessionEvent::ToolCallStarted { .. }
            | SessionEvent::ToolCallCompleted { .. }
            | SessionEvent::ToolCallFailed { .. } => "session.tool",
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionOpened { .. } => "session_opened",
            SessionEvent::SessionOpenFailed { .. } => "session_open_failed",
            SessionEvent::SessionClosed { .. } => "session_closed",
            SessionEvent::ToolDiscoveryCompleted { .. } => "tool_discovery_completed",
            SessionEvent::ToolDiscoveryFailed { .. } => "tool_discovery_failed",
            SessionEvent::ToolCallStarted { .. } => "tool_call_started",
            SessionEvent::ToolCallCompleted { .. } => "tool_call_completed",
            SessionEvent::ToolCallFailed { .. } => "tool_call_failed",
        }
    }

    /// Convert to a JSON payload.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Callback wrapper that receives `(category, event_type, payload)`.
#[derive(Clone)]
pub struct EventEmitter {
    emitter: Arc<dyn Fn(String, String, serde_json::Value) + Send + Sync>,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("emitter", &"<function>")
            .finish()
    }
}

impl EventEmitter {
    /// Create a new emitter from a callback.
    pub fn new<F>(emitter: F) -> Self
    where
        F: Fn(String, String, serde_json::Value) + Send + Sync + 'static,
    {
        Self {
            emitter: Arc::new(emitter),
        }
    }

    pub fn emit(&self, event: &SessionEvent) {
        (self.emitter)(
            event.category().to_string(),
            event.event_type().to_string(),
            event.to_payload(),
        );
    }
}

/// Running counters for tool calls made through one session.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionStatistics {
    /// Total number of tool calls dispatched.
    pub total_tool_calls: u64,
    pub successful_tool_calls: u64,
    pub failed_tool_calls: u64,
    /// Total tool call duration in milliseconds.
    pub total_duration_ms: u64,
    /// Average response time in milliseconds.
    pub avg_response_time_ms: f64,
}

impl SessionStatistics {
    /// Update statistics with a completed tool call.
    pub fn record_tool_call(&mut self, success: bool, duration_ms: u64) {
        self.total_tool_calls += 1;
        if success {
            self.successful_tool_calls += 1;
        } else {
            self.failed_tool_calls += 1;
        }
        self.total_duration_ms += duration_ms;
        self.avg_response_time_ms = self.total_duration_ms as f64 / self.total_tool_calls as f64;
    }

    /// Get the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total_tool_calls == 0 {
            return 100.0;
        }
        (self.successful_tool_calls as f64 / self.total_tool_calls as f64) * 100.0
    }
}
