//! Memory collaborator: tool usage statistics and archived task results

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;
use crate::task::{SubtaskStatus, TaskResult, TaskStatus};

/// One dispatched action, as reported to memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsage {
    /// Tool name, or `gui:<op>` / `code:<language>` for built-in actions
    pub tool: String,
    pub backend: String,
    pub success: bool,
    pub elapsed_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
}

/// An archived task, condensed into a hint for planning a similar goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastTask {
    pub goal: String,
    pub status: TaskStatus,
    /// Descriptions of the subtasks that succeeded, in run order
    pub steps: Vec<String>,
    pub rationale: String,
}

impl From<&TaskResult> for PastTask {
    fn from(result: &TaskResult) -> Self {
        Self {
            goal: result.goal.clone(),
            status: result.status,
            steps: result
                .subtasks
                .iter()
                .filter(|s| s.status == SubtaskStatus::Succeeded)
                .map(|s| if s.description.is_empty() { s.id.clone() } else { s.description.clone() })
                .collect(),
            rationale: result.rationale.clone(),
        }
    }
}

#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn record_tool_usage(&self, usage: ToolUsage);

    async fn archive_task(&self, result: &TaskResult);

    /// Archived tasks worth showing the planner for `goal`, best first
    async fn similar_tasks(&self, _goal: &str, _limit: usize) -> Vec<PastTask> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_elapsed_ms: u64,
}

impl ToolStats {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    pub fn average_ms(&self) -> u64 {
        self.total_elapsed_ms.checked_div(self.calls).unwrap_or(0)
    }
}

/// In-process [`MemorySink`]
#[derive(Default)]
pub struct UsageLedger {
    stats: Mutex<HashMap<String, ToolStats>>,
    archive: Mutex<Vec<TaskResult>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool_stats(&self, tool: &str) -> Option<ToolStats> {
        self.stats.lock().get(tool).cloned()
    }

    /// Stats for every tool seen, sorted by name
    pub fn all_stats(&self) -> Vec<(String, ToolStats)> {
        let mut all: Vec<_> = self
            .stats
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn archived(&self) -> Vec<TaskResult> {
        self.archive.lock().clone()
    }

    /// Archived results whose goals share the most keywords with `goal`
    fn rank_similar(&self, goal: &str, limit: usize) -> Vec<PastTask> {
        let wanted = keywords(goal);
        if wanted.is_empty() {
            return Vec::new();
        }

        let archive = self.archive.lock();
        let mut scored: Vec<(usize, &TaskResult)> = archive
            .iter()
            .map(|result| (keywords(&result.goal).intersection(&wanted).count(), result))
            .filter(|(score, _)| *score > 0)
            .collect();
        // best first, newest first among equals
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.finished_at.cmp(&a.1.finished_at)));

        scored
            .into_iter()
            .take(limit)
            .map(|(_, result)| PastTask::from(result))
            .collect()
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 3)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl MemorySink for UsageLedger {
    async fn record_tool_usage(&self, usage: ToolUsage) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(usage.tool).or_default();
        entry.calls += 1;
        if usage.success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_elapsed_ms += usage.elapsed_ms;
    }

    async fn archive_task(&self, result: &TaskResult) {
        self.archive.lock().push(result.clone());
    }

    async fn similar_tasks(&self, goal: &str, limit: usize) -> Vec<PastTask> {
        self.rank_similar(goal, limit)
    }
}
