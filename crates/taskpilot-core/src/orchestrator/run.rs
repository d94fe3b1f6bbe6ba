//! One task's control loop

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Orchestrator;
use crate::dispatcher::{ActionDispatcher, InFlightCalls};
use crate::error::{ActionFailure, ErrorClass, FailureKind, FailureRecord};
use crate::memory::PastTask;
use crate::reflection::{GraphContext, Reflection, SubtaskOutcome, Verdict};
use crate::task::{
    ActionResult, DependencyGraph, Phase, PlanContext, Subtask, SubtaskReport, SubtaskStatus,
    Task, TaskEvent, TaskResult, TaskStatus,
};

/// Archived tasks offered to the planner alongside a new goal
const SIMILAR_TASK_HINTS: usize = 3;

/// How an execution round ended
enum RoundEnd {
    Completed,
    Replan(Reflection),
    Failed(String),
    Cancelled,
}

/// What a worker hands back for one subtask run
struct SubtaskRun {
    id: String,
    results: Vec<ActionResult>,
    /// Stopped by cancellation, at an action boundary or by force
    interrupted: bool,
}

impl SubtaskRun {
    fn succeeded(&self) -> bool {
        !self.interrupted && self.results.iter().all(|r| r.success)
    }
}

pub(super) struct TaskRun<'a> {
    orchestrator: &'a Orchestrator,
    task: Task,
    cancel: CancellationToken,
    /// `true` while new subtasks are held back
    pause: watch::Receiver<bool>,
    /// Provider calls this task's workers are waiting on
    in_flight: Arc<InFlightCalls>,
    /// Related earlier tasks, looked up once before the first plan
    similar: Vec<PastTask>,
    started: Instant,
    /// Reports of every subtask from finished rounds
    reports: Vec<SubtaskReport>,
    /// Ids superseded by the latest replan
    superseded: Vec<String>,
    failures: Vec<FailureRecord>,
    replans: u32,
    global_retries_left: u32,
    output: Option<Value>,
}

impl<'a> TaskRun<'a> {
    pub(super) fn new(
        orchestrator: &'a Orchestrator,
        task: Task,
        cancel: CancellationToken,
        pause: watch::Receiver<bool>,
    ) -> Self {
        let global_retries_left = orchestrator.context.execution().global_retry_budget;
        Self {
            orchestrator,
            task,
            cancel,
            pause,
            in_flight: InFlightCalls::new(),
            similar: Vec::new(),
            started: Instant::now(),
            reports: Vec::new(),
            superseded: Vec::new(),
            failures: Vec::new(),
            replans: 0,
            global_retries_left,
            output: None,
        }
    }

    pub(super) async fn execute(mut self) -> TaskResult {
        self.task.status = TaskStatus::Running;
        tracing::info!(task_id = %self.task.id, goal = %self.task.goal, "Task started");

        let mut graph = match self.plan(None).await {
            Ok(graph) => graph,
            Err(end) => return self.finish(end).await,
        };

        loop {
            let reflection = match self.execute_round(&graph).await {
                RoundEnd::Replan(reflection) => reflection,
                end => return self.finish(end).await,
            };

            let max_replans = self.orchestrator.context.execution().max_replans;
            if self.replans >= max_replans {
                let rationale = format!(
                    "replan limit ({}) reached: {}",
                    max_replans, reflection.rationale
                );
                return self.finish(RoundEnd::Failed(rationale)).await;
            }
            self.replans += 1;

            let context = PlanContext {
                round: self.replans,
                completed: self.reports.iter().filter(|r| r.runs > 0).cloned().collect(),
                superseded: self.superseded.clone(),
                failures: self.failures.clone(),
                rationale: Some(reflection.rationale),
                signal: reflection.signal,
            };
            graph = match self.plan(Some(&context)).await {
                Ok(graph) => graph,
                Err(end) => return self.finish(end).await,
            };

            tracing::info!(
                task_id = %self.task.id,
                round = self.replans,
                subtasks = graph.len(),
                "Replanned"
            );
            self.orchestrator
                .emit(TaskEvent::Replanned {
                    task_id: self.task.id.clone(),
                    round: self.replans,
                    subtasks: graph.len(),
                });
        }
    }

    async fn plan(&mut self, prior: Option<&PlanContext>) -> Result<DependencyGraph, RoundEnd> {
        let phase = if prior.is_some() {
            Phase::Replanning
        } else {
            Phase::Planning
        };
        self.set_phase(phase);

        let context = Arc::clone(&self.orchestrator.context);
        if prior.is_none()
            && let Some(memory) = &context.memory
        {
            self.similar = memory.similar_tasks(&self.task.goal, SIMILAR_TASK_HINTS).await;
            if !self.similar.is_empty() {
                tracing::debug!(
                    task_id = %self.task.id,
                    similar = self.similar.len(),
                    "Found similar past tasks"
                );
            }
        }

        let catalog = context.registry.snapshot();
        let built = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RoundEnd::Cancelled),
            built = context.planner.build(&self.task.goal, &catalog, prior, &self.similar) => built,
        };

        built.map_err(|e| {
            tracing::warn!(task_id = %self.task.id, error = %e, "Planning failed");
            self.failures.push(FailureRecord::new(
                None,
                FailureKind::Planning,
                ErrorClass::Fatal,
                e.to_string(),
            ));
            RoundEnd::Failed(format!("planning failed: {}", e))
        })
    }

    async fn execute_round(&mut self, graph: &DependencyGraph) -> RoundEnd {
        let context = Arc::clone(&self.orchestrator.context);
        let execution = context.execution().clone();
        let concurrency = execution.concurrency.max(1);
        let round_cancel = self.cancel.child_token();
        let force_cancel = CancellationToken::new();

        let mut statuses: HashMap<String, SubtaskStatus> = graph
            .subtasks()
            .iter()
            .map(|s| (s.id.clone(), SubtaskStatus::Pending))
            .collect();
        let mut reports: HashMap<String, SubtaskReport> = graph
            .subtasks()
            .iter()
            .map(|s| {
                let report = SubtaskReport {
                    id: s.id.clone(),
                    description: s.description.clone(),
                    round: graph.round(),
                    status: SubtaskStatus::Pending,
                    runs: 0,
                    results: Vec::new(),
                };
                (s.id.clone(), report)
            })
            .collect();
        let mut failed_runs: HashMap<String, u32> = HashMap::new();
        let mut workers: JoinSet<SubtaskRun> = JoinSet::new();

        let end = loop {
            let paused = *self.pause.borrow_and_update();
            if paused {
                self.set_phase(Phase::Paused);
            } else {
                self.set_phase(Phase::Executing);
            }

            if !self.cancel.is_cancelled() && !paused {
                for id in graph.ready(&statuses) {
                    if workers.len() >= concurrency {
                        break;
                    }
                    let (Some(subtask), Some(report)) = (graph.subtask(&id), reports.get_mut(&id)) else {
                        continue;
                    };
                    statuses.insert(id.clone(), SubtaskStatus::Running);
                    report.status = SubtaskStatus::Running;
                    report.runs += 1;

                    tracing::debug!(task_id = %self.task.id, subtask = %id, run = report.runs, "Subtask started");
                    self.orchestrator
                        .emit(TaskEvent::SubtaskStarted {
                            task_id: self.task.id.clone(),
                            subtask_id: id.clone(),
                            run: report.runs,
                        });

                    workers.spawn(run_subtask(
                        Arc::clone(&context.dispatcher),
                        subtask.clone(),
                        execution.action_timeout(),
                        execution.max_action_retries,
                        Arc::clone(&self.in_flight),
                        round_cancel.clone(),
                        force_cancel.clone(),
                    ));
                }
            }

            if workers.is_empty() {
                if self.cancel.is_cancelled() {
                    break RoundEnd::Cancelled;
                }
                if paused {
                    tracing::debug!(task_id = %self.task.id, "Task paused");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break RoundEnd::Cancelled,
                        Ok(()) = self.pause.changed() => continue,
                    }
                }
                if statuses.values().all(|s| *s == SubtaskStatus::Succeeded) {
                    break RoundEnd::Completed;
                }
                break RoundEnd::Failed("no runnable subtasks remain".to_string());
            }

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break RoundEnd::Cancelled,
                Ok(()) = self.pause.changed() => continue,
                joined = workers.join_next() => joined,
            };
            let run = match joined {
                Some(Ok(run)) => run,
                Some(Err(e)) => break RoundEnd::Failed(format!("subtask worker failed: {}", e)),
                None => continue,
            };

            self.orchestrator
                .emit(TaskEvent::SubtaskFinished {
                    task_id: self.task.id.clone(),
                    subtask_id: run.id.clone(),
                    success: run.succeeded(),
                });

            if run.interrupted {
                statuses.insert(run.id.clone(), SubtaskStatus::Cancelled);
                if let Some(report) = reports.get_mut(&run.id) {
                    report.status = SubtaskStatus::Cancelled;
                    report.results = run.results;
                }
                continue;
            }

            self.set_phase(Phase::Reflecting);

            let outcome = SubtaskOutcome {
                subtask_id: run.id.clone(),
                description: graph
                    .subtask(&run.id)
                    .map(|s| s.description.clone())
                    .unwrap_or_default(),
                results: run.results,
            };
            if let Some((_, failed)) = outcome.first_failure()
                && let Some(failure) = &failed.error
            {
                self.failures.push(FailureRecord::from_action(&run.id, failure));
                *failed_runs.entry(run.id.clone()).or_default() += 1;
            }

            let graph_context = GraphContext {
                goal: self.task.goal.clone(),
                round: graph.round(),
                failed_runs: failed_runs.get(&run.id).copied().unwrap_or(0),
                subtask_retry_budget: execution.subtask_retry_budget,
                global_retries_left: self.global_retries_left,
                replans_used: self.replans,
                max_replans: execution.max_replans,
                completed: ids_with(&statuses, SubtaskStatus::Succeeded),
                pending: ids_with(&statuses, SubtaskStatus::Pending),
            };
            let reflection = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    statuses.insert(run.id.clone(), SubtaskStatus::Cancelled);
                    if let Some(report) = reports.get_mut(&run.id) {
                        report.status = SubtaskStatus::Cancelled;
                        report.results = outcome.results;
                    }
                    break RoundEnd::Cancelled;
                }
                reflection = context.reflection.reflect(&outcome, &graph_context) => reflection,
            };

            tracing::debug!(
                task_id = %self.task.id,
                subtask = %run.id,
                verdict = ?reflection.verdict,
                rationale = %reflection.rationale,
                "Reflected"
            );
            self.orchestrator
                .emit(TaskEvent::Reflected {
                    task_id: self.task.id.clone(),
                    subtask_id: run.id.clone(),
                    verdict: reflection.verdict.clone(),
                    rationale: reflection.rationale.clone(),
                });

            let status = match &reflection.verdict {
                Verdict::Continue => {
                    if let Some(last) = outcome.results.last() {
                        self.output = Some(last.output.clone());
                    }
                    SubtaskStatus::Succeeded
                }
                Verdict::RetryNode(_) => {
                    self.global_retries_left = self.global_retries_left.saturating_sub(1);
                    tracing::info!(
                        task_id = %self.task.id,
                        subtask = %run.id,
                        retries_left = self.global_retries_left,
                        "Retrying subtask"
                    );
                    SubtaskStatus::Pending
                }
                Verdict::Replan | Verdict::Abort => SubtaskStatus::Failed,
            };
            statuses.insert(run.id.clone(), status);
            if let Some(report) = reports.get_mut(&run.id) {
                report.status = status;
                report.results = outcome.results;
            }

            match reflection.verdict {
                Verdict::Replan => break RoundEnd::Replan(reflection),
                Verdict::Abort => {
                    self.failures.push(FailureRecord::new(
                        Some(run.id.clone()),
                        FailureKind::ReflectionAbort,
                        ErrorClass::Fatal,
                        reflection.rationale.clone(),
                    ));
                    break RoundEnd::Failed(reflection.rationale);
                }
                Verdict::Continue | Verdict::RetryNode(_) => {}
            }
        };

        let cancelled = matches!(end, RoundEnd::Cancelled);
        if !workers.is_empty() {
            round_cancel.cancel();
            let grace = cancelled.then(|| execution.cancel_grace());
            self.wind_down(&mut workers, grace, &force_cancel, &mut statuses, &mut reports)
                .await;
        }

        // Whatever never ran is left behind by this round
        let left_behind = if cancelled {
            SubtaskStatus::Cancelled
        } else {
            SubtaskStatus::Superseded
        };
        self.superseded.clear();
        for id in graph.topological_order() {
            let Some(mut report) = reports.remove(id) else {
                continue;
            };
            if matches!(report.status, SubtaskStatus::Pending | SubtaskStatus::Running) {
                report.status = left_behind;
                if left_behind == SubtaskStatus::Superseded {
                    self.superseded.push(id.clone());
                }
            }
            self.reports.push(report);
        }

        end
    }

    /// Collect the workers still running after the round ended. With a
    /// grace period, actions still in flight when it elapses are cut off
    /// and the providers they were waiting on are reset.
    async fn wind_down(
        &mut self,
        workers: &mut JoinSet<SubtaskRun>,
        grace: Option<Duration>,
        force_cancel: &CancellationToken,
        statuses: &mut HashMap<String, SubtaskStatus>,
        reports: &mut HashMap<String, SubtaskReport>,
    ) {
        let mut deadline = grace.map(|grace| Instant::now() + grace);
        let mut stuck = Vec::new();

        loop {
            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, workers.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        stuck = self.in_flight.providers();
                        tracing::warn!(
                            task_id = %self.task.id,
                            in_flight = workers.len(),
                            providers = ?stuck,
                            "Grace period elapsed, cutting off in-flight actions"
                        );
                        force_cancel.cancel();
                        deadline = None;
                        continue;
                    }
                },
                None => workers.join_next().await,
            };

            let run = match joined {
                Some(Ok(run)) => run,
                Some(Err(_)) => continue,
                None => break,
            };

            let status = if run.succeeded() {
                if let Some(last) = run.results.last() {
                    self.output = Some(last.output.clone());
                }
                SubtaskStatus::Succeeded
            } else if grace.is_some() {
                SubtaskStatus::Cancelled
            } else {
                SubtaskStatus::Superseded
            };
            if status == SubtaskStatus::Superseded {
                self.superseded.push(run.id.clone());
            }
            statuses.insert(run.id.clone(), status);
            if let Some(report) = reports.get_mut(&run.id) {
                report.status = status;
                report.results = run.results;
            }
        }

        // Only providers that were serving this task's cut-off calls
        let providers = &self.orchestrator.context.providers;
        for name in stuck {
            if let Err(e) = providers.reset(&name).await {
                tracing::warn!(provider = %name, error = %e, "Failed to reset tool provider");
            }
        }
    }

    async fn finish(mut self, end: RoundEnd) -> TaskResult {
        let (status, phase, rationale) = match end {
            RoundEnd::Completed => (
                TaskStatus::Succeeded,
                Phase::Completed,
                "all subtasks succeeded".to_string(),
            ),
            RoundEnd::Failed(rationale) => (TaskStatus::Failed, Phase::Failed, rationale),
            RoundEnd::Replan(reflection) => (TaskStatus::Failed, Phase::Failed, reflection.rationale),
            RoundEnd::Cancelled => {
                self.failures.push(FailureRecord::new(
                    None,
                    FailureKind::Cancelled,
                    ErrorClass::Fatal,
                    "task cancelled",
                ));
                (TaskStatus::Cancelled, Phase::Cancelled, "task cancelled".to_string())
            }
        };
        self.set_phase(phase);
        self.task.status = status;

        TaskResult {
            task_id: self.task.id,
            goal: self.task.goal,
            status,
            subtasks: self.reports,
            output: if status == TaskStatus::Succeeded {
                self.output
            } else {
                None
            },
            rationale,
            failure_chain: self.failures,
            replans: self.replans,
            started_at: self.task.created_at,
            finished_at: Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.orchestrator.set_phase(&self.task.id, phase);
    }
}

fn ids_with(statuses: &HashMap<String, SubtaskStatus>, wanted: SubtaskStatus) -> Vec<String> {
    let mut ids: Vec<String> = statuses
        .iter()
        .filter(|(_, status)| **status == wanted)
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids
}

/// Run a subtask's actions in order, stopping at the first failure.
/// `cancel` is observed between actions; `force` cuts off the action in
/// flight.
async fn run_subtask(
    dispatcher: Arc<ActionDispatcher>,
    subtask: Subtask,
    timeout: Duration,
    max_retries: u32,
    calls: Arc<InFlightCalls>,
    cancel: CancellationToken,
    force: CancellationToken,
) -> SubtaskRun {
    let mut results = Vec::with_capacity(subtask.actions.len());

    for action in &subtask.actions {
        if cancel.is_cancelled() {
            return SubtaskRun {
                id: subtask.id,
                results,
                interrupted: true,
            };
        }

        let result = tokio::select! {
            biased;
            _ = force.cancelled() => {
                let backend = dispatcher.backend_for(action);
                results.push(ActionResult::failed(action.clone(), ActionFailure::cancelled(), backend));
                return SubtaskRun {
                    id: subtask.id,
                    results,
                    interrupted: true,
                };
            }
            result = dispatcher.dispatch_tracked(action, timeout, max_retries, Some(&calls)) => result,
        };
        let failed = !result.success;
        results.push(result);
        if failed {
            break;
        }
    }

    SubtaskRun {
        id: subtask.id,
        results,
        interrupted: false,
    }
}
