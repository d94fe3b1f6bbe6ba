//! Task graph builder
//!
//! Asks a [`PlanningService`] for a plan and freezes it into a
//! [`DependencyGraph`], rejecting cycles, dangling dependencies and
//! unregistered tools before anything runs.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Action, DependencyGraph, Subtask, SubtaskReport, SubtaskStatus};
use crate::error::{FailureRecord, PlanningError};
use crate::memory::PastTask;
use crate::reflection::ReflectionSignal;
use crate::registry::{ToolDescriptor, ToolRegistry};

/// What the planning service proposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProposedPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub subtasks: Vec<Subtask>,
}

/// Accumulated results handed to the planner on a replan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanContext {
    /// Round the new plan will run in
    pub round: u32,
    /// Subtasks that already ran, from every earlier round
    pub completed: Vec<SubtaskReport>,
    /// Ids dropped from the previous graph without running
    pub superseded: Vec<String>,
    pub failures: Vec<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<ReflectionSignal>,
}

impl PlanContext {
    /// Ids of subtasks that succeeded in an earlier round
    pub fn succeeded(&self) -> HashSet<&str> {
        self.completed
            .iter()
            .filter(|r| r.status == SubtaskStatus::Succeeded)
            .map(|r| r.id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub goal: String,
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PlanContext>,
    /// Earlier tasks with related goals
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub similar: Vec<PastTask>,
}

/// The external planning collaborator
#[async_trait]
pub trait PlanningService: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<ProposedPlan, PlanningError>;
}

pub struct TaskGraphBuilder {
    service: Arc<dyn PlanningService>,
    /// Resolves tool names the plan spells differently from the catalog
    registry: Option<Arc<ToolRegistry>>,
    timeout: Duration,
    max_subtasks: usize,
}

impl TaskGraphBuilder {
    pub fn new(service: Arc<dyn PlanningService>) -> Self {
        Self {
            service,
            registry: None,
            timeout: Duration::from_secs(60),
            max_subtasks: 50,
        }
    }

    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_subtasks(mut self, max_subtasks: usize) -> Self {
        self.max_subtasks = max_subtasks;
        self
    }

    /// Plan `goal` against `catalog` and validate the result
    pub async fn build(
        &self,
        goal: &str,
        catalog: &[ToolDescriptor],
        prior: Option<&PlanContext>,
        similar: &[PastTask],
    ) -> Result<DependencyGraph, PlanningError> {
        let round = prior.map(|c| c.round).unwrap_or(0);
        let request = PlanRequest {
            goal: goal.to_string(),
            tools: catalog.to_vec(),
            context: prior.cloned(),
            similar: similar.to_vec(),
        };

        let plan = tokio::time::timeout(self.timeout, self.service.plan(&request))
            .await
            .map_err(|_| PlanningError::Timeout(self.timeout))??;

        let graph = self.validate(round, plan, catalog)?;
        tracing::info!(
            round,
            subtasks = graph.len(),
            "Plan accepted"
        );
        Ok(graph)
    }

    fn validate(
        &self,
        round: u32,
        mut plan: ProposedPlan,
        catalog: &[ToolDescriptor],
    ) -> Result<DependencyGraph, PlanningError> {
        if plan.subtasks.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        if plan.subtasks.len() > self.max_subtasks {
            return Err(PlanningError::TooLarge {
                count: plan.subtasks.len(),
                limit: self.max_subtasks,
            });
        }

        let known: HashSet<&str> = catalog.iter().map(|d| d.name.as_str()).collect();
        for subtask in &mut plan.subtasks {
            for action in &mut subtask.actions {
                let Action::Tool { name, .. } = action else {
                    continue;
                };
                if known.contains(name.as_str()) {
                    continue;
                }
                let canonical = self
                    .registry
                    .as_ref()
                    .and_then(|registry| registry.canonical_name(name))
                    .filter(|canonical| known.contains(canonical.as_str()));
                match canonical {
                    Some(canonical) => {
                        tracing::debug!(subtask = %subtask.id, tool = %name, %canonical, "Resolved tool alias");
                        *name = canonical;
                    }
                    None => {
                        return Err(PlanningError::UnknownTool {
                            subtask: subtask.id.clone(),
                            tool: name.clone(),
                        });
                    }
                }
            }
        }

        DependencyGraph::new(round, plan.subtasks)
    }
}

/// Extract a plan from free-form collaborator text: a fenced ```json block,
/// a bare fence, or the first balanced `{...}`. A top-level array is read as
/// the subtask list. The first candidate that reads as a plan wins.
pub fn parse_plan_response(text: &str) -> Result<ProposedPlan, PlanningError> {
    let candidates = [
        Some(text.trim()),
        fenced(text, "```json"),
        fenced(text, "```"),
        first_balanced_object(text),
    ];

    let mut last_error = "no JSON found".to_string();
    for candidate in candidates.into_iter().flatten() {
        let value = match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Array(subtasks)) => serde_json::json!({ "subtasks": subtasks }),
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                last_error = format!("expected a plan object, got {}", other);
                continue;
            }
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };
        match serde_json::from_value(value) {
            Ok(plan) => return Ok(plan),
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(PlanningError::Malformed(last_error))
}

fn fenced<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Serves one fixed plan, read from a file or given directly. On a replan
/// it drops subtasks that already succeeded and the edges that pointed at
/// them.
pub struct StaticPlanner {
    plan: ProposedPlan,
}

impl StaticPlanner {
    pub fn new(plan: ProposedPlan) -> Self {
        Self { plan }
    }

    pub fn from_file(path: &Path) -> Result<Self, PlanningError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PlanningError::Service(format!("failed to read plan {}: {}", path.display(), e))
        })?;
        parse_plan_response(&text).map(Self::new)
    }
}

#[async_trait]
impl PlanningService for StaticPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<ProposedPlan, PlanningError> {
        let Some(context) = &request.context else {
            return Ok(self.plan.clone());
        };

        let done = context.succeeded();
        let subtasks = self
            .plan
            .subtasks
            .iter()
            .filter(|s| !done.contains(s.id.as_str()))
            .map(|s| Subtask {
                depends_on: s
                    .depends_on
                    .iter()
                    .filter(|d| !done.contains(d.as_str()))
                    .cloned()
                    .collect(),
                ..s.clone()
            })
            .collect();

        Ok(ProposedPlan {
            summary: self.plan.summary.clone(),
            subtasks,
        })
    }
}
