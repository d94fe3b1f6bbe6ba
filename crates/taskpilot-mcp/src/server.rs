//! Provider side of the wire format
//!
//! Hosts an [`McpHandler`] over any pair of byte streams. Requests are
//! answered concurrently, so responses may leave in a different order than
//! the requests arrived.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::protocol::{self, Incoming, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, methods};
use crate::transport::MAX_LINE_LENGTH;
use crate::{ContentItem, McpTool, PROTOCOL_VERSION, ServerCapabilities, ToolCallResult, ToolsCapability};

/// Handler for MCP requests
#[async_trait]
pub trait McpHandler: Send + Sync {
    /// List available tools
    async fn list_tools(&self) -> Vec<McpTool>;

    /// Call a tool. `Err` is reported to the client as an `isError` result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, String>;
}

/// MCP Server
pub struct McpServer<H: McpHandler> {
    handler: Arc<H>,
    capabilities: ServerCapabilities,
    server_name: String,
    server_version: String,
}

impl<H: McpHandler + 'static> McpServer<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
            },
            server_name: "taskpilot-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Handle a JSON-RPC request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(request.id),
            methods::TOOLS_LIST => self.handle_tools_list(request.id).await,
            methods::TOOLS_CALL => self.handle_tools_call(request.id, request.params).await,
            _ => JsonRpcResponse::error(request.id, JsonRpcError::method_not_found()),
        }
    }

    /// Serve requests from `reader` until it reaches end of stream
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut sink = FramedWrite::new(writer, LinesCodec::new());
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let line = match serde_json::to_string(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize response");
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = lines.next().await {
            let line = frame.map_err(std::io::Error::other)?;
            match protocol::parse_message(line.trim()) {
                Ok(Incoming::Request(request)) => {
                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = server.handle_request(request).await;
                        let _ = tx.send(response);
                    });
                }
                Ok(Incoming::Notification(notification)) => {
                    tracing::debug!(method = %notification.method, "Client notification");
                }
                Ok(Incoming::Response(_)) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed request line"),
            }
        }

        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    fn handle_initialize(&self, id: RequestId) -> JsonRpcResponse {
        let result = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": self.capabilities,
            "serverInfo": {
                "name": self.server_name,
                "version": self.server_version
            }
        });

        JsonRpcResponse::success(id, result)
    }

    async fn handle_tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let tools = self.handler.list_tools().await;
        JsonRpcResponse::success(id, serde_json::json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params = match params {
            Some(p) => p,
            None => return JsonRpcResponse::error(id, JsonRpcError::invalid_params()),
        };

        let name = match params.get("name").and_then(|v| v.as_str()) {
            Some(n) => n,
            None => return JsonRpcResponse::error(id, JsonRpcError::invalid_params()),
        };

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        let result = match self.handler.call_tool(name, arguments).await {
            Ok(Value::String(text)) => ToolCallResult {
                content: vec![ContentItem::text(text)],
                ..Default::default()
            },
            Ok(value) => ToolCallResult {
                content: vec![ContentItem::text(value.to_string())],
                structured_content: Some(value),
                ..Default::default()
            },
            Err(message) => ToolCallResult {
                content: vec![ContentItem::text(message)],
                is_error: true,
                ..Default::default()
            },
        };

        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(
                id,
                JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()),
            ),
        }
    }
}
