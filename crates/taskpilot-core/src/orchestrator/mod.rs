//! Orchestrator
//!
//! Drives a task from goal to result: plan, run ready subtasks on a bounded
//! worker pool, reflect on each finished subtask before its dependents are
//! released, and replan or stop as the reflection decides.
//!
//! Phases: `Idle -> Planning -> Executing -> Reflecting -> {Executing |
//! Replanning | Completed | Failed}`, and `Cancelled` from any of them.
//! A paused task sits in `Paused` between subtasks until resumed.

mod run;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::AgentContext;
use crate::error::{Error, Result};
use crate::task::{Phase, Task, TaskEvent, TaskId, TaskResult};

use run::TaskRun;

struct TaskEntry {
    goal: String,
    phase: Phase,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// What a running task listens to
struct TaskControl {
    cancel: CancellationToken,
    pause: watch::Receiver<bool>,
}

/// A task running in the background
pub struct TaskHandle {
    pub id: TaskId,
    join: JoinHandle<TaskResult>,
}

impl TaskHandle {
    /// Wait for the task's result
    pub async fn join(self) -> Result<TaskResult> {
        self.join
            .await
            .map_err(|e| Error::Task(format!("task {} did not finish: {}", self.id, e)))
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    context: Arc<AgentContext>,
    tasks: Arc<Mutex<HashMap<TaskId, TaskEntry>>>,
    event_tx: Option<mpsc::Sender<TaskEvent>>,
}

impl Orchestrator {
    pub fn new(context: Arc<AgentContext>) -> Self {
        Self {
            context,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            event_tx: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<TaskEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Run a goal to completion
    pub async fn execute_task(&self, goal: &str) -> TaskResult {
        let task = Task::new(goal);
        let control = self.register(&task);
        self.drive(task, control).await
    }

    /// Run a goal in the background; the returned id can be cancelled
    pub fn spawn_task(&self, goal: &str) -> TaskHandle {
        let task = Task::new(goal);
        let id = task.id.clone();
        let control = self.register(&task);

        let this = self.clone();
        let join = tokio::spawn(async move { this.drive(task, control).await });
        TaskHandle { id, join }
    }

    /// Request a cooperative stop. Actions in flight may finish; nothing new
    /// starts. Actions still running after the grace period are cut off,
    /// and the providers they were waiting on are reset.
    pub fn cancel_task(&self, id: &str) -> Result<()> {
        let tasks = self.tasks.lock();
        let entry = tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        tracing::info!(task_id = %id, phase = ?entry.phase, "Cancelling task");
        entry.cancel.cancel();
        Ok(())
    }

    /// Hold back a task's next subtasks. Subtasks already running finish
    /// and are reflected on as usual.
    pub fn pause_task(&self, id: &str) -> Result<()> {
        self.set_paused(id, true)
    }

    pub fn resume_task(&self, id: &str) -> Result<()> {
        self.set_paused(id, false)
    }

    fn set_paused(&self, id: &str, paused: bool) -> Result<()> {
        let tasks = self.tasks.lock();
        let entry = tasks
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        if entry.pause.send_replace(paused) != paused {
            tracing::info!(task_id = %id, paused, "Task pause toggled");
        }
        Ok(())
    }

    /// Tasks that have not finished yet, with their goal and phase
    pub fn running_tasks(&self) -> Vec<(TaskId, String, Phase)> {
        let mut tasks: Vec<_> = self
            .tasks
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.goal.clone(), entry.phase))
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        tasks
    }

    /// Current phase of an unfinished task
    pub fn phase(&self, id: &str) -> Option<Phase> {
        self.tasks.lock().get(id).map(|entry| entry.phase)
    }

    fn register(&self, task: &Task) -> TaskControl {
        let cancel = CancellationToken::new();
        let (pause, paused) = watch::channel(false);
        self.tasks.lock().insert(
            task.id.clone(),
            TaskEntry {
                goal: task.goal.clone(),
                phase: Phase::Idle,
                cancel: cancel.clone(),
                pause,
            },
        );
        TaskControl {
            cancel,
            pause: paused,
        }
    }

    async fn drive(&self, task: Task, control: TaskControl) -> TaskResult {
        let task_id = task.id.clone();
        let result = TaskRun::new(self, task, control.cancel, control.pause)
            .execute()
            .await;
        self.tasks.lock().remove(&task_id);

        tracing::info!(
            task_id = %task_id,
            status = ?result.status,
            replans = result.replans,
            elapsed_ms = result.elapsed_ms,
            "Task finished"
        );
        self.emit(TaskEvent::Finished {
            task_id,
            status: result.status,
        });

        if let Some(memory) = &self.context.memory {
            memory.archive_task(&result).await;
        }
        result
    }

    fn set_phase(&self, task_id: &str, phase: Phase) {
        let changed = match self.tasks.lock().get_mut(task_id) {
            Some(entry) if entry.phase != phase => {
                entry.phase = phase;
                true
            }
            _ => false,
        };
        if changed {
            tracing::debug!(task_id = %task_id, ?phase, "Phase changed");
            self.emit(TaskEvent::PhaseChanged {
                task_id: task_id.to_string(),
                phase,
            });
        }
    }

    /// Events are dropped rather than stalling the task when the listener
    /// falls behind
    fn emit(&self, event: TaskEvent) {
        let Some(tx) = &self.event_tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(?event, "Event listener is behind, dropping event");
            }
        }
    }
}
