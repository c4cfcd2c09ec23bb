//! Stdio transport for local tool servers.
//!
//! The server runs as a child process; messages are newline-delimited JSON
//! on its stdin and stdout. Anything the server prints to stderr is
//! forwarded to `tracing` at debug level.
//!
//! Both directions survive a caller dropping `send` midway. Outgoing frames
//! are handed to a writer task that owns stdin and always writes a frame
//! whole. Incoming bytes accumulate in a buffer kept across reads, so a
//! line interrupted by a timeout is completed by the next read.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Transport, TransportError};
use crate::types::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// One serialized message and the channel its write result goes back on.
struct Frame {
    bytes: Vec<u8>,
    written: oneshot::Sender<Result<(), TransportError>>,
}

/// Server stdout split into lines, with any partial line kept between reads.
struct LineReader {
    reader: BufReader<ChildStdout>,
    pending: Vec<u8>,
}

impl LineReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            reader: BufReader::new(stdout),
            pending: Vec::new(),
        }
    }

    /// Next complete line without its terminator, or `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let read = self.reader.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// Stdio transport for local tool servers.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<String>,
    process: Mutex<Option<Child>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    stdout: Mutex<Option<LineReader>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport that will spawn `command` with `args` on connect.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            working_dir: None,
            process: Mutex::new(None),
            writer: Mutex::new(None),
            writer_task: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr_task: Mutex::new(None),
        }
    }

    /// Set environment variables for the child process.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the working directory for the child process.
    pub fn with_working_dir(mut self, working_dir: Option<String>) -> Self {
        self.working_dir = working_dir;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Queue a message for the writer task and wait until it is flushed.
    ///
    /// Once queued, the frame is written in full even if this future is
    /// dropped.
    async fn write_message(&self, message: &impl serde::Serialize) -> Result<(), TransportError> {
        let mut bytes = serde_json::to_vec(message).map_err(TransportError::malformed)?;
        bytes.push(b'\n');
        let len = bytes.len();

        let (written, done) = oneshot::channel();
        {
            let guard = self.writer.lock().await;
            let writer = guard.as_ref().ok_or(TransportError::NotConnected)?;
            writer
                .send(Frame { bytes, written })
                .map_err(|_| self.writer_gone())?;
        }
        done.await.map_err(|_| self.writer_gone())??;

        trace!("Wrote message to stdin: {} bytes", len);
        Ok(())
    }

    fn writer_gone(&self) -> TransportError {
        TransportError::Disconnected(format!("stdin of '{}' is closed", self.command))
    }

    /// Read lines until the response for `id` arrives.
    async fn read_response(&self, id: &RequestId) -> Result<JsonRpcResponse, TransportError> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            let line = stdout
                .next_line()
                .await
                .map_err(|e| TransportError::Disconnected(format!("Failed to read stdout: {}", e)))?
                .ok_or_else(|| {
                    TransportError::Disconnected(format!("'{}' closed its stdout", self.command))
                })?;

            let line = std::str::from_utf8(&line).map_err(|e| {
                TransportError::Malformed(format!("stdout line is not valid UTF-8: {}", e))
            })?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match parse_incoming(trimmed)? {
                Incoming::Response(response) if id.matches(&response.id) => return Ok(response),
                Incoming::Response(response) => {
                    trace!("Skipping response for abandoned request {}", response.id);
                }
                Incoming::Request { id: server_id, method } => {
                    // The session serves nothing; answer so the server is not left waiting.
                    let reply = if method == "ping" {
                        JsonRpcResponse::success(server_id, serde_json::json!({}))
                    } else {
                        JsonRpcResponse::error(server_id, JsonRpcError::method_not_found(&method))
                    };
                    debug!("Answering server request '{}'", method);
                    self.write_message(&reply).await?;
                }
                Incoming::Notification { method } => {
                    trace!("Received notification: {}", method);
                }
            }
        }
    }
}

/// Spawn the task that owns `stdin` and writes queued frames one at a time.
fn spawn_writer(
    mut stdin: ChildStdin,
    command: String,
) -> (mpsc::UnboundedSender<Frame>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match stdin.write_all(&frame.bytes).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            let _ = frame.written.send(result.map_err(write_error));
        }
        trace!("stdin writer for '{}' stopped", command);
    });
    (tx, task)
}

fn write_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::BrokenPipe => {
            TransportError::Disconnected(format!("Failed to write message: {}", err))
        }
        _ => TransportError::io(format!("Failed to write message: {}", err)),
    }
}

/// One decoded line from the server.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response(JsonRpcResponse),
    Request { id: RequestId, method: String },
    Notification { method: String },
}

pub(crate) fn parse_incoming(line: &str) -> Result<Incoming, TransportError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| TransportError::Malformed(format!("Failed to parse JSON: {}", e)))?;

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        return match value.get("id").filter(|id| !id.is_null()) {
            Some(id) => {
                let id: RequestId = serde_json::from_value(id.clone())
                    .map_err(|e| TransportError::Malformed(format!("Invalid request id: {}", e)))?;
                Ok(Incoming::Request { id, method })
            }
            None => Ok(Incoming::Notification { method }),
        };
    }

    serde_json::from_value(value)
        .map(Incoming::Response)
        .map_err(|e| TransportError::Malformed(format!("Invalid response: {}", e)))
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        info!("Spawning tool server: {} {:?}", self.command, self.args);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Connect(format!("Failed to spawn '{}': {}", self.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::connect("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::connect("Failed to capture stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            let task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("{} stderr: {}", command, line);
                }
            });
            if let Some(previous) = self.stderr_task.lock().await.replace(task) {
                previous.abort();
            }
        }

        let (writer, writer_task) = spawn_writer(stdin, self.command.clone());
        if let Some(previous) = self.writer_task.lock().await.replace(writer_task) {
            previous.abort();
        }
        *self.writer.lock().await = Some(writer);
        *self.stdout.lock().await = Some(LineReader::new(stdout));
        *process = Some(child);

        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        trace!("Sending request: method={}, id={}", request.method, request.id);
        self.write_message(&request).await?;
        self.read_response(&request.id).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        trace!("Sending notification: method={}", notification.method);
        self.write_message(&notification).await
    }

    async fn cancel(&self, request_id: RequestId) -> Result<(), TransportError> {
        debug!("Cancelling request {} on '{}'", request_id, self.command);
        self.notify(JsonRpcNotification::cancelled(&request_id, "request timed out"))
            .await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }

        // Killing first unblocks any reader still holding stdout.
        if let Some(mut child) = self.process.lock().await.take() {
            info!("Stopping tool server: {}", self.command);
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill '{}': {}", self.command, e);
            }
            let _ = child.wait().await;
        }

        self.writer.lock().await.take();
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
        self.stdout.lock().await.take();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.process.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_incoming_response() {
        let parsed = parse_incoming(r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(
            parsed,
            Incoming::Response(JsonRpcResponse::success(
                RequestId::Number(3),
                json!({ "tools": [] })
            ))
        );
    }

    #[test]
    fn test_parse_incoming_server_request_and_notification() {
        let parsed = parse_incoming(r#"{"jsonrpc":"2.0","id":"s-1","method":"ping"}"#).unwrap();
        assert_eq!(
            parsed,
            Incoming::Request {
                id: RequestId::String("s-1".to_string()),
                method: "ping".to_string()
            }
        );

        let parsed =
            parse_incoming(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            Incoming::Notification {
                method: "notifications/tools/list_changed".to_string()
            }
        );
    }

    #[test]
    fn test_parse_incoming_malformed() {
        assert!(matches!(
            parse_incoming("{not json"),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            parse_incoming(r#"{"jsonrpc":"2.0"}"#),
            Err(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_for_missing_command() {
        let transport = StdioTransport::new("definitely-not-a-real-tool-server-binary", vec![]);
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(!transport.is_connected().await);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = StdioTransport::new("unused", vec![]);
        let request = JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        assert_eq!(
            transport.send(request).await,
            Err(TransportError::NotConnected)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_skips_stale_lines() {
        let script = r#"read line
echo '{"jsonrpc":"2.0","method":"notifications/message","params":{}}'
echo '{"jsonrpc":"2.0","id":99,"result":{}}'
echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'
read rest"#;
        let transport = StdioTransport::new("sh", vec!["-c".to_string(), script.to_string()]);
        transport.connect().await.unwrap();
        assert!(transport.is_connected().await);

        let request = JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        let response = transport.send(request).await.unwrap();
        assert_eq!(response.result, Some(json!({ "ok": true })));

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_exit_is_disconnect() {
        let transport = StdioTransport::new(
            "sh",
            vec!["-c".to_string(), "read line; exit 0".to_string()],
        );
        transport.connect().await.unwrap();

        let request = JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        let result = transport.send(request).await;
        assert!(matches!(result, Err(TransportError::Disconnected(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_mid_line_keeps_partial_bytes() {
        let script = r#"read line
printf '{"jsonrpc":"2.0","id":1,'
sleep 1
printf '"result":{"late":true}}\n'
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"ok":true}}'
read rest"#;
        let transport = StdioTransport::new("sh", vec!["-c".to_string(), script.to_string()]);
        transport.connect().await.unwrap();

        let first = JsonRpcRequest::new(RequestId::Number(1), "tools/call", None);
        let timed_out =
            tokio::time::timeout(Duration::from_millis(300), transport.send(first)).await;
        assert!(timed_out.is_err());

        let second = JsonRpcRequest::new(RequestId::Number(2), "tools/call", None);
        let response = transport.send(second).await.unwrap();
        assert_eq!(response.result, Some(json!({ "ok": true })));

        transport.disconnect().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_line_is_malformed() {
        let transport = StdioTransport::new(
            "sh",
            vec![
                "-c".to_string(),
                r"read line; printf '\377\376\n'; read rest".to_string(),
            ],
        );
        transport.connect().await.unwrap();

        let request = JsonRpcRequest::new(RequestId::Number(1), "tools/list", None);
        let result = transport.send(request).await;
        assert!(matches!(result, Err(TransportError::Malformed(_))));

        transport.disconnect().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_write_still_sends_whole_frame() {
        let script = r#"read first
case "$first" in
  *'"method":"notifications/cancelled"'*'}') status=whole ;;
  *) status=torn ;;
esac
read second
echo "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"first\":\"$status\"}}"
read rest"#;
        let transport = StdioTransport::new("sh", vec!["-c".to_string(), script.to_string()]);
        transport.connect().await.unwrap();

        // Larger than a pipe buffer, so the write cannot finish on the first poll.
        let reason = "x".repeat(200_000);
        let notification = JsonRpcNotification::cancelled(&RequestId::Number(1), reason);
        assert!(transport.notify(notification).now_or_never().is_none());

        let request = JsonRpcRequest::new(RequestId::Number(2), "tools/list", None);
        let response = transport.send(request).await.unwrap();
        assert_eq!(response.result, Some(json!({ "first": "whole" })));

        transport.disconnect().await.unwrap();
    }
}
