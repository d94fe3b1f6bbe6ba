//! Provider sessions
//!
//! A [`Session`] is one connection to one tool provider. Requests carry
//! unique numeric ids and any number of them may be in flight at once; a
//! background reader task routes each response to the caller waiting on its
//! id. Responses that match no waiting caller are discarded.
//!
//! Lifecycle: `Disconnected -> Connecting -> Ready -> Closing -> Disconnected`.
//! If the provider's output stream ends while connected the session drops
//! straight back to `Disconnected` and every waiting caller fails with
//! [`McpError::ProcessExited`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_util::codec::LinesCodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::McpError;
use crate::pending::{PendingGuard, PendingRequests};
use crate::protocol::{
    self, Incoming, JsonRpcNotification, JsonRpcRequest, RequestId, methods,
};
use crate::transport::{self, LineReader, LineWriter, ProviderCommand};
use crate::{ClientInfo, McpTool, PROTOCOL_VERSION, ServerCapabilities, ServerInfo, ToolCallResult};

/// How long a killed provider gets to be reaped
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Limit on the whole `initialize` exchange
    pub handshake_timeout: Duration,
    /// Limit on `tools/list`
    pub request_timeout: Duration,
    /// Extra spawn+handshake attempts after the first one fails
    pub connect_retries: u32,
    pub retry_delay: Duration,
    /// How long `close` waits for in-flight calls before cancelling them
    pub close_grace: Duration,
    /// Longer lines from the provider are dropped
    pub max_line_length: usize,
    pub client_info: ClientInfo,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            connect_retries: 1,
            retry_delay: Duration::from_millis(200),
            close_grace: Duration::from_secs(2),
            max_line_length: transport::MAX_LINE_LENGTH,
            client_info: ClientInfo::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    protocol_version: String,
    #[serde(default)]
    capabilities: ServerCapabilities,
    server_info: PeerInfo,
}

#[derive(Debug, Deserialize)]
struct PeerInfo {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    tools: Vec<McpTool>,
}

/// State shared with the reader task
struct Shared {
    state: watch::Sender<SessionState>,
    pending: PendingRequests,
    next_id: AtomicI64,
    writer: tokio::sync::Mutex<Option<LineWriter>>,
    server: parking_lot::Mutex<Option<ServerInfo>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Resources held while connected
struct Connection {
    child: Option<Child>,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

/// One connection to one tool provider
pub struct Session {
    name: String,
    options: SessionOptions,
    shared: Arc<Shared>,
    /// Serializes connect and close
    lifecycle: tokio::sync::Mutex<Option<Connection>>,
}

impl Session {
    pub fn new(name: impl Into<String>, options: SessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            name: name.into(),
            options,
            shared: Arc::new(Shared {
                state,
                pending: PendingRequests::default(),
                next_id: AtomicI64::new(1),
                writer: tokio::sync::Mutex::new(None),
                server: parking_lot::Mutex::new(None),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server.lock().clone()
    }

    /// Number of requests currently awaiting a response
    pub fn in_flight(&self) -> usize {
        self.shared.pending.len()
    }

    /// Spawn the provider and perform the handshake, retrying the whole
    /// attempt up to `connect_retries` more times. Connecting a session that
    /// is already ready is a no-op.
    pub async fn connect(&self, command: &ProviderCommand) -> Result<ServerInfo, McpError> {
        let mut slot = self.lifecycle.lock().await;
        if let Some(info) = self.ready_info() {
            return Ok(info);
        }

        let attempts = self.options.connect_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connect_once(&mut slot, command).await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    tracing::warn!(
                        provider = %self.name,
                        attempt,
                        attempts,
                        error = %e,
                        "Provider connection attempt failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(McpError::ProcessExited))
    }

    /// Attach to an already-running provider through a pair of byte streams
    /// and perform the handshake. No retries: the streams are consumed.
    pub async fn connect_streams<R, W>(&self, reader: R, writer: W) -> Result<ServerInfo, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut slot = self.lifecycle.lock().await;
        if let Some(info) = self.ready_info() {
            return Ok(info);
        }

        self.shared.set_state(SessionState::Connecting);
        self.attach(&mut slot, Box::new(reader), Box::new(writer), None, None)
            .await
    }

    /// Discover the provider's tools. Only valid while ready.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self
            .request(methods::TOOLS_LIST, None, self.options.request_timeout, false)
            .await?;
        let list: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/list result: {}", e)))?;
        Ok(list.tools)
    }

    /// Invoke a tool. Fails with `Timeout` if no response arrives within
    /// `timeout`, or `ProcessExited` if the provider goes away first.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self
            .request(methods::TOOLS_CALL, Some(params), timeout, false)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/call result: {}", e)))
    }

    /// Close with the configured grace period
    pub async fn close(&self) -> Result<(), McpError> {
        self.close_with_grace(self.options.close_grace).await
    }

    /// Stop accepting calls, wait up to `grace` for in-flight calls, cancel
    /// the rest, then release stdout, the process and stdin in that order.
    /// Closing an already-closed session does nothing.
    pub async fn close_with_grace(&self, grace: Duration) -> Result<(), McpError> {
        let mut slot = self.lifecycle.lock().await;
        self.teardown(&mut slot, grace).await;
        Ok(())
    }

    fn ready_info(&self) -> Option<ServerInfo> {
        if self.shared.state() == SessionState::Ready {
            self.server_info()
        } else {
            None
        }
    }

    async fn connect_once(
        &self,
        slot: &mut Option<Connection>,
        command: &ProviderCommand,
    ) -> Result<ServerInfo, McpError> {
        self.shared.set_state(SessionState::Connecting);
        tracing::debug!(provider = %self.name, command = %command, "Spawning provider");

        let process = match transport::spawn(command) {
            Ok(process) => process,
            Err(e) => {
                self.shared.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        let stderr = process
            .stderr
            .map(|stderr| transport::forward_stderr(self.name.clone(), stderr));

        self.attach(
            slot,
            Box::new(process.stdout),
            Box::new(process.stdin),
            Some(process.child),
            stderr,
        )
        .await
    }

    async fn attach(
        &self,
        slot: &mut Option<Connection>,
        reader: transport::BoxedReader,
        writer: transport::BoxedWriter,
        child: Option<Child>,
        stderr: Option<JoinHandle<()>>,
    ) -> Result<ServerInfo, McpError> {
        *self.shared.writer.lock().await = Some(transport::line_writer(writer));
        let reader = tokio::spawn(read_loop(
            self.name.clone(),
            Arc::clone(&self.shared),
            transport::line_reader(reader, self.options.max_line_length),
        ));
        *slot = Some(Connection {
            child,
            reader,
            stderr,
        });

        match self.handshake().await {
            Ok(info) => {
                *self.shared.server.lock() = Some(info.clone());
                self.shared.set_state(SessionState::Ready);
                tracing::info!(
                    provider = %self.name,
                    server = %info.name,
                    protocol_version = %info.protocol_version,
                    "Provider session ready"
                );
                Ok(info)
            }
            Err(e) => {
                self.teardown(slot, Duration::ZERO).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<ServerInfo, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.options.client_info.name,
                "version": self.options.client_info.version,
            }
        });

        let result = self
            .request(methods::INITIALIZE, Some(params), self.options.handshake_timeout, true)
            .await
            .map_err(|e| McpError::Handshake(e.to_string()))?;

        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Handshake(format!("malformed initialize result: {}", e)))?;

        if init.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                provider = %self.name,
                ours = PROTOCOL_VERSION,
                theirs = %init.protocol_version,
                "Provider negotiated a different protocol version"
            );
        }

        self.write(&JsonRpcNotification::new(methods::INITIALIZED))
            .await
            .map_err(|e| McpError::Handshake(e.to_string()))?;

        Ok(ServerInfo {
            name: init.server_info.name,
            version: init.server_info.version,
            protocol_version: init.protocol_version,
            capabilities: init.capabilities,
        })
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        during_handshake: bool,
    ) -> Result<Value, McpError> {
        self.ensure_accepting(during_handshake)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.shared.pending.register(id);
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            id,
        };
        // close may have started between the check and the registration
        self.ensure_accepting(during_handshake)?;

        let mut request = JsonRpcRequest::new(RequestId::Number(id), method);
        request.params = params;
        self.write(&request).await?;
        tracing::trace!(provider = %self.name, id, method, "Request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => response.into_result().map_err(|e| McpError::Server {
                code: e.code,
                message: e.message,
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(McpError::Cancelled),
            Err(_) => {
                tracing::warn!(provider = %self.name, id, method, ?timeout, "Request timed out");
                Err(McpError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    fn ensure_accepting(&self, during_handshake: bool) -> Result<(), McpError> {
        match self.shared.state() {
            SessionState::Ready => Ok(()),
            SessionState::Connecting if during_handshake => Ok(()),
            state => Err(McpError::NotReady(state)),
        }
    }

    async fn write<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let line = serde_json::to_string(message).map_err(|e| McpError::Protocol(e.to_string()))?;
        let mut writer = self.shared.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| McpError::Transport("provider input stream is closed".to_string()))?;
        writer
            .send(line)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))
    }

    async fn teardown(&self, slot: &mut Option<Connection>, grace: Duration) {
        if slot.is_none() && self.shared.state() == SessionState::Disconnected {
            tracing::debug!(provider = %self.name, "Session already closed");
            return;
        }

        self.shared.set_state(SessionState::Closing);

        if !grace.is_zero() && !self.shared.pending.wait_drained(grace).await {
            tracing::debug!(
                provider = %self.name,
                in_flight = self.shared.pending.len(),
                "Grace period elapsed with calls in flight"
            );
        }
        let cancelled = self.shared.pending.fail_all(McpError::Cancelled);
        if cancelled > 0 {
            tracing::warn!(provider = %self.name, cancelled, "Cancelled in-flight calls on close");
        }

        if let Some(connection) = slot.take() {
            connection.reader.abort();
            let _ = connection.reader.await;

            if let Some(mut child) = connection.child {
                reap(&self.name, &mut child).await;
            }
            if let Some(stderr) = connection.stderr {
                stderr.abort();
            }
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            // Broken pipe is expected once the process is gone
            let _ = SinkExt::<String>::close(&mut writer).await;
        }

        self.shared.server.lock().take();
        self.shared.set_state(SessionState::Disconnected);
        tracing::info!(provider = %self.name, "Provider session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connection) = self.lifecycle.get_mut().take() {
            connection.reader.abort();
            if let Some(stderr) = connection.stderr {
                stderr.abort();
            }
            // kill_on_drop takes care of the child
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn reap(provider: &str, child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(provider = %provider, %status, "Provider already exited");
        }
        _ => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(provider = %provider, error = %e, "Failed to signal provider");
            }
            match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(provider = %provider, %status, "Provider reaped"),
                Ok(Err(e)) => tracing::warn!(provider = %provider, error = %e, "Failed to reap provider"),
                Err(_) => tracing::warn!(provider = %provider, "Provider did not exit after kill"),
            }
        }
    }
}

async fn read_loop(provider: String, shared: Arc<Shared>, mut reader: LineReader) {
    // The framed reader yields one `None` after a decode error before it
    // resumes reading
    let mut resume = false;
    loop {
        let frame = match reader.next().await {
            Some(frame) => frame,
            None if resume => {
                resume = false;
                continue;
            }
            None => break,
        };
        let line = match frame {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(provider = %provider, "Dropping oversized line from provider");
                resume = true;
                continue;
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::warn!(provider = %provider, error = %e, "Failed to read from provider");
                break;
            }
        };
        resume = false;

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match protocol::parse_message(line) {
            Ok(Incoming::Response(response)) => {
                let id = response.id.clone();
                let delivered = id
                    .as_number()
                    .is_some_and(|n| shared.pending.complete(n, response));
                if !delivered {
                    tracing::debug!(provider = %provider, id = %id, "Discarding response with no waiting caller");
                }
            }
            Ok(Incoming::Notification(notification)) => {
                tracing::debug!(provider = %provider, method = %notification.method, "Provider notification");
            }
            Ok(Incoming::Request(request)) => {
                tracing::debug!(provider = %provider, method = %request.method, "Ignoring provider-initiated request");
            }
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "Dropping malformed line from provider");
            }
        }
    }

    let lost = shared.state.send_if_modified(|state| {
        if matches!(state, SessionState::Ready | SessionState::Connecting) {
            *state = SessionState::Disconnected;
            true
        } else {
            false
        }
    });
    if lost {
        tracing::warn!(provider = %provider, "Provider output closed unexpectedly");
    }

    let failed = shared.pending.fail_all(McpError::ProcessExited);
    if failed > 0 {
        tracing::warn!(provider = %provider, failed, "Failed in-flight calls after provider exit");
    }
}
