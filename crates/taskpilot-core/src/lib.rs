//! Taskpilot Core - goal-driven task orchestration
//!
//! This crate provides the control plane of the Taskpilot agent:
//! - Tool descriptor registry and provider session management
//! - Action dispatch with bounded retries, timeouts and fallbacks
//! - Task graph planning and validation
//! - Reflection on subtask outcomes
//! - The orchestrator that ties them together

pub mod backend;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod reflection;
pub mod registry;
pub mod task;

pub use backend::{CodeBackend, CodeOutput, CodeRequest, GuiBackend, GuiRequest, Unavailable};
#[cfg(feature = "sandbox")]
pub use backend::SandboxCodeBackend;
pub use config::{Config, ConfigManager, ExecutionConfig, FallbackBackend, ProviderConfig};
pub use context::{AgentContext, AgentContextBuilder};
pub use dispatcher::{ActionDispatcher, InFlightCalls, normalize_tool_result};
pub use error::{
    ActionFailure, Error, ErrorClass, ExecutionError, FailureKind, FailureRecord, PlanningError,
    Result,
};
pub use memory::{MemorySink, PastTask, ToolStats, ToolUsage, UsageLedger};
pub use orchestrator::{Orchestrator, TaskHandle};
pub use providers::{ProviderManager, ProviderReport, ProviderStatus};
pub use reflection::{
    HeuristicReflector, Reflection, ReflectionEngine, ReflectionService, Verdict,
};
pub use registry::{BackendRef, ToolDescriptor, ToolRegistry};
pub use task::{
    Action, ActionResult, CodeMode, DependencyGraph, Phase, PlanningService, ProposedPlan,
    StaticPlanner, Subtask, SubtaskStatus, Task, TaskEvent, TaskGraphBuilder, TaskResult,
    TaskStatus,
};
