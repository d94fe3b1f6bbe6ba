//! Reflection engine
//!
//! Decides what happens after a subtask finishes. Local rules settle the
//! common cases without outside help; the reflection service is consulted
//! only once a failed subtask has used up its retry budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, FailureKind};
use crate::task::ActionResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "subtask", rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    RetryNode(String),
    Replan,
    Abort,
}

/// Structured hint for the planner on a replan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_action: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflection {
    pub verdict: Verdict,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<ReflectionSignal>,
}

impl Reflection {
    pub fn new(verdict: Verdict, rationale: impl Into<String>) -> Self {
        Self {
            verdict,
            rationale: rationale.into(),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: Option<ReflectionSignal>) -> Self {
        self.signal = signal;
        self
    }
}

/// Results of one subtask run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    pub subtask_id: String,
    pub description: String,
    pub results: Vec<ActionResult>,
}

impl SubtaskOutcome {
    /// Every action ran and succeeded (vacuously true with no actions)
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn first_failure(&self) -> Option<(usize, &ActionResult)> {
        self.results.iter().enumerate().find(|(_, r)| !r.success)
    }

    pub fn signal(&self) -> Option<ReflectionSignal> {
        self.first_failure().map(|(index, result)| ReflectionSignal {
            failing_tool: result.action.tool_name().map(str::to_string),
            failing_action: Some(index),
            class: result.error.as_ref().map(|e| e.class),
        })
    }

    fn failure_class(&self) -> Option<ErrorClass> {
        self.first_failure()
            .and_then(|(_, r)| r.error.as_ref())
            .map(|e| e.class)
    }
}

/// Where the task stands when a subtask is reflected on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphContext {
    pub goal: String,
    pub round: u32,
    /// Failed runs of this subtask, including the one being reflected on
    pub failed_runs: u32,
    pub subtask_retry_budget: u32,
    pub global_retries_left: u32,
    pub replans_used: u32,
    pub max_replans: u32,
    pub completed: Vec<String>,
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRequest {
    pub outcome: SubtaskOutcome,
    pub context: GraphContext,
}

/// The external reflection collaborator. Asked only to choose between
/// `Replan` and `Abort`; any other verdict is read as `Replan`.
#[async_trait]
pub trait ReflectionService: Send + Sync {
    async fn reflect(&self, request: &ReflectionRequest) -> Result<Reflection, String>;
}

pub struct ReflectionEngine {
    service: Arc<dyn ReflectionService>,
    timeout: Duration,
}

impl ReflectionEngine {
    pub fn new(service: Arc<dyn ReflectionService>) -> Self {
        Self {
            service,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn reflect(&self, outcome: &SubtaskOutcome, context: &GraphContext) -> Reflection {
        if outcome.succeeded() {
            return Reflection::new(Verdict::Continue, "all actions succeeded");
        }

        let signal = outcome.signal();
        let transient = outcome.failure_class() == Some(ErrorClass::Transient);

        if transient
            && context.failed_runs < context.subtask_retry_budget
            && context.global_retries_left > 0
        {
            return Reflection::new(
                Verdict::RetryNode(outcome.subtask_id.clone()),
                format!(
                    "transient failure, run {} of {}",
                    context.failed_runs, context.subtask_retry_budget
                ),
            )
            .with_signal(signal);
        }

        // The replan cap wins over anything the service might say
        if context.replans_used >= context.max_replans {
            return Reflection::new(
                Verdict::Abort,
                format!(
                    "subtask '{}' failed and the replan limit ({}) is reached",
                    outcome.subtask_id, context.max_replans
                ),
            )
            .with_signal(signal);
        }

        let request = ReflectionRequest {
            outcome: outcome.clone(),
            context: context.clone(),
        };
        tracing::debug!(subtask = %outcome.subtask_id, "Consulting reflection service");

        let reflection = match tokio::time::timeout(self.timeout, self.service.reflect(&request)).await {
            Ok(Ok(reflection)) => reflection,
            Ok(Err(e)) => {
                tracing::warn!(subtask = %outcome.subtask_id, error = %e, "Reflection service failed");
                Reflection::new(Verdict::Replan, format!("reflection unavailable: {}", e))
            }
            Err(_) => {
                tracing::warn!(subtask = %outcome.subtask_id, "Reflection service timed out");
                Reflection::new(Verdict::Replan, "reflection timed out")
            }
        };

        let verdict = match reflection.verdict {
            Verdict::Abort => Verdict::Abort,
            Verdict::Replan => Verdict::Replan,
            other => {
                tracing::debug!(?other, "Reading escalated verdict as replan");
                Verdict::Replan
            }
        };

        Reflection {
            verdict,
            rationale: reflection.rationale,
            signal: reflection.signal.or(signal),
        }
    }
}

/// Rule-based reflection: permission and validation failures abort,
/// everything else replans
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicReflector;

const ABORT_MARKERS: &[&str] = &["permission", "denied", "forbidden", "unauthorized", "invalid"];

#[async_trait]
impl ReflectionService for HeuristicReflector {
    async fn reflect(&self, request: &ReflectionRequest) -> Result<Reflection, String> {
        let Some((index, failed)) = request.outcome.first_failure() else {
            return Ok(Reflection::new(Verdict::Replan, "no failed action recorded"));
        };
        let Some(error) = &failed.error else {
            return Ok(Reflection::new(Verdict::Replan, "failure without classification"));
        };

        let lower = error.message.to_lowercase();
        let abort = error.kind == FailureKind::Cancelled
            || (error.class == ErrorClass::Fatal
                && ABORT_MARKERS.iter().any(|marker| lower.contains(marker)));

        let verdict = if abort { Verdict::Abort } else { Verdict::Replan };
        Ok(Reflection::new(
            verdict,
            format!(
                "action {} ({}) failed: {}",
                index,
                failed.action.label(),
                error.message
            ),
        ))
    }
}
