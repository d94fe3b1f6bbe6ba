//! Errors raised by provider sessions

use std::time::Duration;

use crate::session::SessionState;

/// MCP errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("Failed to spawn provider '{command}': {reason}")]
    Spawn { command: String, reason: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("Provider process exited")]
    ProcessExited,
    #[error("Session is not ready (state: {0})")]
    NotReady(SessionState),
    #[error("Request cancelled")]
    Cancelled,
    #[error("Server error ({code}): {message}")]
    Server { code: i64, message: String },
}

impl McpError {
    /// Whether repeating the same request on the same session may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}
