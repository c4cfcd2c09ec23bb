//! Scripted mock transport for session integration testing.
//!
//! Routes requests to a [`MockToolServer`] and records every call so tests
//! can assert on traffic. Clones share state: keep one handle for
//! inspection and hand a boxed clone to the session.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use toolsession::transport::{Transport, TransportError};
use toolsession::types::*;

use super::mock_tool_server::MockToolServer;

#[derive(Default)]
struct Script {
    delay: Option<Duration>,
    hang_on: HashSet<String>,
    drop_on: HashSet<String>,
    io_error_on: HashSet<String>,
    fail_connect: Option<String>,
}

struct Inner {
    server: Arc<MockToolServer>,
    script: Mutex<Script>,
    connected: AtomicBool,
    sends: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    notifications: Mutex<Vec<JsonRpcNotification>>,
}

/// A mock transport that talks to a [`MockToolServer`].
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    /// Create a new mock transport with the given server.
    pub fn new(server: MockToolServer) -> Self {
        Self::shared(Arc::new(server))
    }

    pub fn shared(server: Arc<MockToolServer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                script: Mutex::new(Script::default()),
                connected: AtomicBool::new(false),
                sends: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                notifications: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a boxed transport sharing this handle's state.
    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn server(&self) -> &MockToolServer {
        &self.inner.server
    }

    /// Delay every response by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner.script.lock().unwrap().delay = delay;
    }

    /// Never answer requests for `method`.
    pub fn hang_on(&self, method: &str) {
        self.inner.script.lock().unwrap().hang_on.insert(method.to_string());
    }

    pub fn stop_hanging(&self) {
        self.inner.script.lock().unwrap().hang_on.clear();
    }

    /// Report the peer gone when `method` is sent.
    pub fn drop_on(&self, method: &str) {
        self.inner.script.lock().unwrap().drop_on.insert(method.to_string());
    }

    /// Fail `method` with a transient I/O error.
    pub fn io_error_on(&self, method: &str) {
        self.inner
            .script
            .lock()
            .unwrap()
            .io_error_on
            .insert(method.to_string());
    }

    /// Set whether `connect` should fail.
    pub fn set_fail_connect(&self, message: Option<&str>) {
        self.inner.script.lock().unwrap().fail_connect = message.map(str::to_string);
    }

    /// Number of `send` calls, failed or not.
    pub fn sends(&self) -> usize {
        self.inner.sends.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<JsonRpcNotification> {
        self.inner.notifications.lock().unwrap().clone()
    }

    /// Notifications with the given method.
    pub fn notified(&self, method: &str) -> Vec<JsonRpcNotification> {
        self.notifications()
            .into_iter()
            .filter(|n| n.method == method)
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.inner.script.lock().unwrap().fail_connect.clone() {
            return Err(TransportError::Connect(message));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.inner.sends.fetch_add(1, Ordering::SeqCst);
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let (delay, hang, drop, io_error) = {
            let script = self.inner.script.lock().unwrap();
            (
                script.delay,
                script.hang_on.contains(&request.method),
                script.drop_on.contains(&request.method),
                script.io_error_on.contains(&request.method),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if drop {
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Disconnected("peer went away".to_string()));
        }
        if io_error {
            return Err(TransportError::Io("connection reset".to_string()));
        }

        Ok(self.inner.server.handle_request(request))
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.inner.notifications.lock().unwrap().push(notification);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
