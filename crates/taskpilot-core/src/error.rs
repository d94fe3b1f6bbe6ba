//! Error types for Taskpilot Core
//!
//! Failures are classified where they originate and travel as data
//! ([`ActionFailure`], [`FailureRecord`]) so the orchestrator can act on the
//! classification instead of on the error type.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskpilot_mcp::McpError;
use taskpilot_mcp::protocol::JsonRpcError;
use thiserror::Error;

/// Result type alias using Taskpilot Error
pub type Result<T> = std::result::Result<T, Error>;

/// Taskpilot error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] McpError),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Whether repeating the failed operation may help
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Which layer a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Planning,
    Protocol,
    Execution,
    ReflectionAbort,
    Cancelled,
}

/// Error returned by GUI and code backends
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub class: ErrorClass,
    pub message: String,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
        }
    }

    /// Classify by message keywords
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: classify_message(&message),
            message,
        }
    }
}

/// A classified failure attached to a failed action result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub class: ErrorClass,
    pub message: String,
}

impl ActionFailure {
    pub fn execution(error: ExecutionError) -> Self {
        Self {
            kind: FailureKind::Execution,
            class: error.class,
            message: error.message,
        }
    }

    pub fn protocol(error: &McpError) -> Self {
        Self {
            kind: FailureKind::Protocol,
            class: classify_mcp(error),
            message: error.to_string(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FailureKind::Execution,
            class: ErrorClass::Transient,
            message: format!("action timed out after {:?}", after),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            class: ErrorClass::Fatal,
            message: "cancelled".to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

/// One link in a failed task's chain of classified failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask: Option<String>,
    pub kind: FailureKind,
    pub class: ErrorClass,
    pub message: String,
}

impl FailureRecord {
    pub fn new(
        subtask: Option<String>,
        kind: FailureKind,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subtask,
            kind,
            class,
            message: message.into(),
        }
    }

    pub fn from_action(subtask: &str, failure: &ActionFailure) -> Self {
        Self::new(
            Some(subtask.to_string()),
            failure.kind,
            failure.class,
            failure.message.clone(),
        )
    }
}

/// Errors from building a dependency graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Dependency cycle among subtasks: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Subtask '{subtask}' depends on unknown subtask '{dependency}'")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("Subtask '{subtask}' uses unregistered tool '{tool}'")]
    UnknownTool { subtask: String, tool: String },

    #[error("Duplicate subtask id '{0}'")]
    DuplicateSubtask(String),

    #[error("Plan contains no subtasks")]
    EmptyPlan,

    #[error("Plan has {count} subtasks, limit is {limit}")]
    TooLarge { count: usize, limit: usize },

    #[error("Malformed plan: {0}")]
    Malformed(String),

    #[error("Planning service failed: {0}")]
    Service(String),

    #[error("Planning timed out after {0:?}")]
    Timeout(Duration),
}

// Checked before the transient markers: "permission denied: file not found"
// is still a permission problem.
const FATAL_MARKERS: &[&str] = &[
    "permission",
    "denied",
    "forbidden",
    "unauthorized",
    "invalid",
    "not allowed",
    "unsupported",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "not ready",
    "not found",
    "not visible",
    "connection",
    "network",
    "temporarily",
    "unavailable",
    "busy",
    "try again",
];

/// Keyword classification of a free-text error message
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if FATAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ErrorClass::Fatal;
    }
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Fatal
}

/// Classification of a provider session error
pub fn classify_mcp(error: &McpError) -> ErrorClass {
    match error {
        McpError::Timeout { .. } | McpError::Transport(_) => ErrorClass::Transient,
        McpError::Server { code, .. }
            if *code == JsonRpcError::METHOD_NOT_FOUND || *code == JsonRpcError::INVALID_PARAMS =>
        {
            ErrorClass::Fatal
        }
        McpError::Server { message, .. } => classify_message(message),
        // The session already spent its own connect budget
        _ => ErrorClass::Fatal,
    }
}
