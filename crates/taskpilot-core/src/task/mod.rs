//! Task data model
//!
//! A [`Task`] is one goal being worked on. Planning produces [`Subtask`]s,
//! each an ordered list of [`Action`]s, frozen into a
//! [`DependencyGraph`](graph::DependencyGraph) for one execution round.

pub mod graph;
pub mod planner;

pub use graph::DependencyGraph;
pub use planner::{
    PlanContext, PlanRequest, PlanningService, ProposedPlan, StaticPlanner, TaskGraphBuilder,
    parse_plan_response,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActionFailure, FailureRecord};

/// Unique task identifier
pub type TaskId = String;

/// How code source is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeMode {
    #[default]
    Script,
    Expression,
}

/// The minimal dispatchable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    /// Drive the GUI backend
    Gui {
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        options: Value,
    },
    /// Run generated code
    Code {
        language: String,
        source: String,
        #[serde(default)]
        mode: CodeMode,
    },
    /// Call a registered tool
    Tool {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

impl Action {
    pub fn tool(name: impl Into<String>, arguments: Value) -> Self {
        Self::Tool {
            name: name.into(),
            arguments,
        }
    }

    pub fn gui(operation: impl Into<String>, target: Option<&str>) -> Self {
        Self::Gui {
            operation: operation.into(),
            target: target.map(str::to_string),
            value: None,
            options: Value::Null,
        }
    }

    pub fn code(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self::Code {
            language: language.into(),
            source: source.into(),
            mode: CodeMode::Script,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Gui { .. } => "gui",
            Self::Code { .. } => "code",
            Self::Tool { .. } => "tool",
        }
    }

    /// Tool name, for `tool` actions
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Self::Tool { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Short label for logs and usage statistics
    pub fn label(&self) -> String {
        match self {
            Self::Gui { operation, .. } => format!("gui:{}", operation),
            Self::Code { language, .. } => format!("code:{}", language),
            Self::Tool { name, .. } => name.clone(),
        }
    }
}

/// A node in the dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            actions: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Dropped by a replan before it ran
    Superseded,
    Cancelled,
}

/// Outcome of one action execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: Action,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionFailure>,
    /// Which backend served the action (`gui`, `code`, `provider:<name>`)
    #[serde(default)]
    pub backend: String,
    pub elapsed_ms: u64,
    /// Dispatch attempts made, including the first
    pub attempts: u32,
}

impl ActionResult {
    pub fn succeeded(action: Action, output: Value, backend: impl Into<String>) -> Self {
        Self {
            action,
            success: true,
            output,
            error: None,
            backend: backend.into(),
            elapsed_ms: 0,
            attempts: 1,
        }
    }

    pub fn failed(action: Action, failure: ActionFailure, backend: impl Into<String>) -> Self {
        Self {
            action,
            success: false,
            output: Value::Null,
            error: Some(failure),
            backend: backend.into(),
            elapsed_ms: 0,
            attempts: 1,
        }
    }

    /// Retries consumed beyond the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Overall task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Orchestrator state for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Planning,
    Executing,
    Reflecting,
    Replanning,
    /// Held at a subtask boundary until resumed
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// A goal being worked on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Per-subtask record in a task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskReport {
    pub id: String,
    pub description: String,
    /// Planning round the subtask belonged to (0 for the first plan)
    pub round: u32,
    pub status: SubtaskStatus,
    /// Times the subtask was run
    pub runs: u32,
    /// Results of the latest run
    pub results: Vec<ActionResult>,
}

/// Final result of `execute_task`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub goal: String,
    pub status: TaskStatus,
    pub subtasks: Vec<SubtaskReport>,
    /// Output of the last action of the last subtask to succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Why the task ended the way it did
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_chain: Vec<FailureRecord>,
    pub replans: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Progress notifications emitted while a task runs
#[derive(Debug, Clone)]
pub enum TaskEvent {
    PhaseChanged {
        task_id: TaskId,
        phase: Phase,
    },
    SubtaskStarted {
        task_id: TaskId,
        subtask_id: String,
        run: u32,
    },
    SubtaskFinished {
        task_id: TaskId,
        subtask_id: String,
        success: bool,
    },
    Reflected {
        task_id: TaskId,
        subtask_id: String,
        verdict: crate::reflection::Verdict,
        rationale: String,
    },
    Replanned {
        task_id: TaskId,
        round: u32,
        subtasks: usize,
    },
    Finished {
        task_id: TaskId,
        status: TaskStatus,
    },
}
