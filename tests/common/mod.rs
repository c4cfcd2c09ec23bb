//! Common test utilities for session integration tests.

#![allow(dead_code)]

pub mod mock_tool_server;
pub mod mock_transport;

pub use mock_tool_server::{tool, HandshakeMode, MockToolServer};
pub use mock_transport::MockTransport;
