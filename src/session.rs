//! Client session for a remote tool server.
//!
//! A [`ToolSession`] owns one transport and moves through
//! `Uninitialized -> Ready -> Closed`. It performs the handshake, discovers
//! tools, and validates every invocation against the last listing before
//! anything reaches the wire.
//!
//! # Example
//! ```rust,ignore
//! use serde_json::json;
//! use toolsession::{ServerConfig, ToolSession};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = ServerConfig::new_stdio("maps", "Maps", "node", vec!["server.js".into()]);
//! let session = ToolSession::with_config(server.build_transport()?, server.session_config());
//!
//! session.open(None).await?;
//! let catalog = session.list_tools(None).await?;
//! println!("tools: {:?}", catalog.names());
//!
//! let result = session.invoke("echo", json!({ "text": "hi" }), None).await;
//! println!("{:?}", result);
//!
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{EventEmitter, SessionEvent, SessionStatistics};
use crate::jsonrpc::{unpack_response, Reply, RequestIdGenerator};
use crate::tool::{InvocationRequest, InvocationResult, ToolCatalog};
use crate::transport::Transport;
use crate::types::{
    methods, CallToolRequest, CallToolResult, Implementation, InitializeRequest,
    InitializeResponse, JsonRpcNotification, JsonRpcRequest, ListToolsRequest, ListToolsResult,
    RequestId, ServerCapabilities,
};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Constructed; the handshake has not succeeded yet.
    Uninitialized,
    /// Handshake done; tools may be listed and invoked.
    Ready,
    /// Terminal. Build a new session to reconnect.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// What the server told us during the handshake.
#[derive(Debug, Clone)]
struct ServerDetails {
    info: Implementation,
    capabilities: ServerCapabilities,
    protocol_version: String,
    instructions: Option<String>,
}

/// Why a guarded future did not finish.
enum Interrupted {
    TimedOut(Duration),
    Closed,
}

/// Absolute bound for one operation, with the caller's original duration.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    fn start(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(|timeout| Self {
            at: Instant::now() + timeout,
            timeout,
        })
    }
}

/// Marks one operation in flight; released on drop.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Client session bound to one tool server.
///
/// All operations take `&self`. At most one of [`open`](Self::open),
/// [`list_tools`](Self::list_tools) and [`invoke`](Self::invoke) runs at a
/// time; a concurrent second call fails with [`SessionError::SessionBusy`].
/// [`close`](Self::close) may be called at any moment and resolves any
/// pending operation with a connection error.
pub struct ToolSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    ids: RequestIdGenerator,
    state: watch::Sender<SessionState>,
    busy: AtomicBool,
    server: RwLock<Option<ServerDetails>>,
    tools: RwLock<ToolCatalog>,
    emitter: RwLock<Option<EventEmitter>>,
    statistics: RwLock<SessionStatistics>,
}

impl fmt::Debug for ToolSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSession")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ToolSession {
    /// Create a session with default settings.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            transport: Arc::from(transport),
            config,
            ids: RequestIdGenerator::new(),
            state,
            busy: AtomicBool::new(false),
            server: RwLock::new(None),
            tools: RwLock::new(ToolCatalog::empty()),
            emitter: RwLock::new(None),
            statistics: RwLock::new(SessionStatistics::default()),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Server implementation info from the handshake.
    pub async fn server_info(&self) -> Option<Implementation> {
        self.server.read().await.as_ref().map(|s| s.info.clone())
    }

    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.server.read().await.as_ref().map(|s| s.capabilities.clone())
    }

    /// Protocol version the server selected.
    pub async fn protocol_version(&self) -> Option<String> {
        self.server
            .read()
            .await
            .as_ref()
            .map(|s| s.protocol_version.clone())
    }

    /// Usage hints the server sent with its handshake response.
    pub async fn instructions(&self) -> Option<String> {
        self.server
            .read()
            .await
            .as_ref()
            .and_then(|s| s.instructions.clone())
    }

    /// The catalog from the last successful listing, without a round trip.
    pub async fn known_tools(&self) -> ToolCatalog {
        self.tools.read().await.clone()
    }

    pub async fn statistics(&self) -> SessionStatistics {
        self.statistics.read().await.clone()
    }

    /// Install a callback receiving [`SessionEvent`]s.
    pub async fn set_event_emitter(&self, emitter: EventEmitter) {
        *self.emitter.write().await = Some(emitter);
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Connect the transport and perform the handshake.
    ///
    /// Valid only while uninitialized. Connection failures and timeouts leave
    /// the session uninitialized so `open` can be retried; a malformed or
    /// incompatible handshake closes it.
    pub async fn open(&self, timeout: Option<Duration>) -> SessionResult<()> {
        let _guard = self.begin()?;
        self.require(SessionState::Uninitialized, "open")?;

        info!("Opening session");
        let deadline = Deadline::start(timeout.or(self.config.default_timeout));
        let result = self.handshake(deadline).await;

        match &result {
            Ok(details) => {
                info!(
                    "Session ready: server={} {}, protocol={}",
                    details.info.name, details.info.version, details.protocol_version
                );
                self.emit(SessionEvent::SessionOpened {
                    server_name: details.info.name.clone(),
                    server_version: details.info.version.clone(),
                    protocol_version: details.protocol_version.clone(),
                })
                .await;
            }
            Err(err) => {
                match err {
                    SessionError::Protocol(_) => self.force_close(&err.to_string()).await,
                    SessionError::Connection(_) if self.state() == SessionState::Uninitialized => {
                        // Release whatever was set up so a retry starts clean.
                        if let Err(e) = self.transport.disconnect().await {
                            debug!("Disconnect after failed open: {}", e);
                        }
                    }
                    _ => {}
                }
                warn!("Failed to open session: {}", err);
                self.emit(SessionEvent::SessionOpenFailed {
                    kind: err.kind(),
                    error: err.to_string(),
                })
                .await;
            }
        }

        result.map(|_| ())
    }

    /// Fetch the server's tools, following pagination to the end.
    ///
    /// The returned catalog replaces the one used to validate invocations.
    pub async fn list_tools(&self, timeout: Option<Duration>) -> SessionResult<ToolCatalog> {
        let _guard = self.begin()?;
        self.require(SessionState::Ready, "list tools")?;

        let started = Instant::now();
        let deadline = Deadline::start(timeout.or(self.config.default_timeout));
        let result = self.fetch_catalog(deadline).await;
        let result = self.settle(result).await;

        match &result {
            Ok(catalog) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!("Listed {} tool(s) in {}ms", catalog.len(), duration_ms);
                *self.tools.write().await = catalog.clone();
                self.emit(SessionEvent::ToolDiscoveryCompleted {
                    tool_count: catalog.len(),
                    duration_ms,
                })
                .await;
            }
            Err(err) => {
                self.emit(SessionEvent::ToolDiscoveryFailed {
                    kind: err.kind(),
                    error: err.to_string(),
                })
                .await;
            }
        }

        result
    }

    /// Run a tool from the last listing.
    ///
    /// `arguments` must be a JSON object (or `null`) satisfying the tool's
    /// input schema. On success the raw `tools/call` result is returned
    /// unmodified.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        let _guard = self.begin()?;
        self.require(SessionState::Ready, "invoke")?;

        let result = match self.prepare_call(name, &arguments).await {
            Ok(arguments) => {
                self.emit(SessionEvent::ToolCallStarted {
                    tool_name: name.to_string(),
                })
                .await;

                let started = Instant::now();
                let deadline = Deadline::start(timeout.or(self.config.default_timeout));
                let result = self.call_tool(name, arguments, deadline).await;
                let result = self.settle(result).await;

                let duration_ms = started.elapsed().as_millis() as u64;
                self.statistics
                    .write()
                    .await
                    .record_tool_call(result.is_ok(), duration_ms);
                if result.is_ok() {
                    debug!("Tool '{}' completed in {}ms", name, duration_ms);
                    self.emit(SessionEvent::ToolCallCompleted {
                        tool_name: name.to_string(),
                        duration_ms,
                    })
                    .await;
                }
                result
            }
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            debug!("Tool '{}' failed: {}", name, err);
            self.emit(SessionEvent::ToolCallFailed {
                tool_name: name.to_string(),
                kind: err.kind(),
                error: err.to_string(),
            })
            .await;
        }

        result
    }

    /// [`invoke`](Self::invoke) taking a prepared request.
    pub async fn invoke_request(
        &self,
        request: &InvocationRequest,
        timeout: Option<Duration>,
    ) -> InvocationResult {
        self.invoke(&request.tool_name, request.arguments.clone(), timeout)
            .await
    }

    /// Close the session and release the transport. Idempotent.
    ///
    /// Pending operations resolve with [`SessionError::Connection`].
    pub async fn close(&self) -> SessionResult<()> {
        let previous = self.state.send_replace(SessionState::Closed);
        if previous == SessionState::Closed {
            debug!("Session already closed");
            return Ok(());
        }

        info!("Closing session (was {})", previous);
        let result = self.transport.disconnect().await.map_err(SessionError::from);
        self.emit(SessionEvent::SessionClosed {
            reason: "close requested".to_string(),
        })
        .await;
        result
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn begin(&self) -> SessionResult<InFlight<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| InFlight(&self.busy))
            .map_err(|_| SessionError::SessionBusy)
    }

    fn require(&self, expected: SessionState, operation: &str) -> SessionResult<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(SessionError::SessionClosed {
                state,
                operation: operation.to_string(),
            })
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(emitter) = self.emitter.read().await.as_ref() {
            emitter.emit(&event);
        }
    }

    /// Resolves once the session reaches `Closed`.
    fn closed_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
        }
    }

    /// Run `fut` until it finishes, the deadline passes, or the session closes.
    async fn guarded<F, T>(&self, deadline: Option<Deadline>, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        let closed = self.closed_signal();
        let bounded = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline.at, fut)
                    .await
                    .map_err(|_| Interrupted::TimedOut(deadline.timeout)),
                None => Ok(fut.await),
            }
        };

        tokio::select! {
            biased;
            _ = closed => Err(Interrupted::Closed),
            result = bounded => result,
        }
    }

    /// Send one request and unpack its reply.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Deadline>,
    ) -> SessionResult<Reply> {
        let id = self.ids.next_id();
        debug!("-> {} (id={})", method, id);
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let response = match self.guarded(deadline, self.transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                if err.is_fatal() && self.state() == SessionState::Ready {
                    self.force_close(&format!("transport lost: {}", err)).await;
                }
                return Err(err.into());
            }
            Err(Interrupted::Closed) => {
                return Err(SessionError::Connection(format!(
                    "session closed while {} was pending",
                    method
                )));
            }
            Err(Interrupted::TimedOut(timeout)) => {
                self.spawn_cancel(id);
                return Err(SessionError::Timeout {
                    operation: method.to_string(),
                    timeout,
                });
            }
        };

        let reply = unpack_response(&id, response)?;
        debug!("<- {} (id={})", method, id);
        Ok(reply)
    }

    /// Tell the server about an abandoned request without waiting.
    fn spawn_cancel(&self, id: RequestId) {
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = transport.cancel(id.clone()).await {
                warn!("Failed to cancel request {}: {}", id, e);
            }
        });
    }

    /// Close on protocol violations; pass every result through.
    async fn settle<T>(&self, result: SessionResult<T>) -> SessionResult<T> {
        if let Err(err @ SessionError::Protocol(_)) = &result {
            self.force_close(&err.to_string()).await;
        }
        result
    }

    async fn force_close(&self, reason: &str) {
        let previous = self.state.send_replace(SessionState::Closed);
        if previous == SessionState::Closed {
            return;
        }
        warn!("Closing session: {}", reason);
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to disconnect transport: {}", e);
        }
        self.emit(SessionEvent::SessionClosed {
            reason: reason.to_string(),
        })
        .await;
    }

    async fn handshake(&self, deadline: Option<Deadline>) -> SessionResult<ServerDetails> {
        let connect_timeout = |timeout| SessionError::Timeout {
            operation: "connect".to_string(),
            timeout,
        };
        match self.guarded(deadline, self.transport.connect()).await {
            Ok(result) => result?,
            Err(Interrupted::TimedOut(timeout)) => return Err(connect_timeout(timeout)),
            Err(Interrupted::Closed) => {
                return Err(SessionError::connection("session closed while connecting"))
            }
        }

        let preferred = self
            .config
            .preferred_version()
            .ok_or_else(|| SessionError::protocol("no protocol versions configured"))?;
        let params = InitializeRequest::new(
            preferred,
            Implementation::new(&self.config.client_name, &self.config.client_version),
        );
        let params = serde_json::to_value(&params).map_err(SessionError::protocol)?;

        let reply = self.request(methods::INITIALIZE, Some(params), deadline).await?;
        let result = match reply {
            Reply::Result(result) => result,
            Reply::Error(error) => {
                return Err(SessionError::Protocol(format!(
                    "server rejected initialize ({}): {}",
                    error.code, error.message
                )));
            }
        };

        let response: InitializeResponse = serde_json::from_value(result)
            .map_err(|e| SessionError::Protocol(format!("invalid initialize response: {}", e)))?;
        if !self.config.supports_version(&response.protocol_version) {
            return Err(SessionError::Protocol(format!(
                "server selected unsupported protocol version '{}'",
                response.protocol_version
            )));
        }
        debug!(
            "Handshake accepted: protocol={}, capabilities={:?}",
            response.protocol_version, response.capabilities
        );

        let initialized = JsonRpcNotification::new(methods::INITIALIZED, None);
        match self.guarded(deadline, self.transport.notify(initialized)).await {
            Ok(result) => result?,
            Err(Interrupted::TimedOut(timeout)) => {
                return Err(SessionError::Timeout {
                    operation: methods::INITIALIZED.to_string(),
                    timeout,
                })
            }
            Err(Interrupted::Closed) => {
                return Err(SessionError::connection("session closed during handshake"))
            }
        }

        let details = ServerDetails {
            info: response.server_info,
            capabilities: response.capabilities,
            protocol_version: response.protocol_version,
            instructions: response.instructions,
        };
        *self.server.write().await = Some(details.clone());

        // A concurrent close wins; never resurrect a closed session.
        let opened = self.state.send_if_modified(|state| {
            if *state == SessionState::Uninitialized {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if !opened {
            return Err(SessionError::connection("session closed during handshake"));
        }

        Ok(details)
    }

    async fn fetch_catalog(&self, deadline: Option<Deadline>) -> SessionResult<ToolCatalog> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        loop {
            let params = serde_json::to_value(ListToolsRequest {
                cursor: cursor.clone(),
            })
            .map_err(SessionError::protocol)?;

            let result = match self.request(methods::TOOLS_LIST, Some(params), deadline).await? {
                Reply::Result(result) => result,
                Reply::Error(error) => {
                    return Err(SessionError::RemoteExecution {
                        tool: methods::TOOLS_LIST.to_string(),
                        code: Some(error.code),
                        message: error.message,
                        payload: error.data,
                    });
                }
            };

            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| SessionError::Protocol(format!("invalid tools/list result: {}", e)))?;
            tools.extend(page.tools);

            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        return Err(SessionError::Protocol(format!(
                            "server repeated pagination cursor '{}'",
                            next
                        )));
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        Ok(ToolCatalog::from_tools(tools))
    }

    /// Look the tool up and validate its arguments.
    async fn prepare_call(&self, name: &str, arguments: &Value) -> SessionResult<Map<String, Value>> {
        let tools = self.tools.read().await;
        let descriptor = tools.get(name).ok_or_else(|| SessionError::UnknownTool {
            name: name.to_string(),
        })?;
        descriptor.validate(arguments)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        deadline: Option<Deadline>,
    ) -> InvocationResult {
        let params = serde_json::to_value(CallToolRequest {
            name: name.to_string(),
            arguments,
        })
        .map_err(SessionError::protocol)?;

        match self.request(methods::TOOLS_CALL, Some(params), deadline).await? {
            Reply::Error(error) => Err(SessionError::RemoteExecution {
                tool: name.to_string(),
                code: Some(error.code),
                message: error.message,
                payload: error.data,
            }),
            Reply::Result(result) if result.get("isError") == Some(&Value::Bool(true)) => {
                let message = serde_json::from_value::<CallToolResult>(result.clone())
                    .ok()
                    .map(|r| r.text())
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| "tool reported an error".to_string());
                Err(SessionError::RemoteExecution {
                    tool: name.to_string(),
                    code: None,
                    message,
                    payload: Some(result),
                })
            }
            Reply::Result(result) => Ok(result),
        }
    }
}
