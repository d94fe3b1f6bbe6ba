//! Orchestrator integration tests
//!
//! End-to-end task runs against scripted planners, reflection services and
//! backends, plus an in-process tool provider.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use taskpilot_core::config::FallbackBackend;
use taskpilot_core::memory::UsageLedger;
use taskpilot_core::reflection::{HeuristicReflector, Verdict};
use taskpilot_core::{
    Action, AgentContext, Config, Error, FailureKind, Orchestrator, Phase, PlanningError,
    ProviderConfig, ProviderStatus, Subtask, SubtaskStatus, TaskEvent, TaskStatus,
};

use common::{
    FixedReflector, Files, ScriptedGui, ScriptedPlanner, Stall, eventually, fast_config, plan,
    serve,
};

fn orchestrator(
    config: Config,
    planner: Arc<ScriptedPlanner>,
    reflector: Arc<FixedReflector>,
    gui: Arc<ScriptedGui>,
) -> Orchestrator {
    let context = AgentContext::builder(config)
        .planner(planner)
        .reflector(reflector)
        .gui(gui)
        .code(Arc::new(common::EchoCode::default()))
        .build()
        .unwrap();
    Orchestrator::new(Arc::new(context))
}

fn mark(target: &str, delay_ms: u64) -> Action {
    Action::Gui {
        operation: "mark".to_string(),
        target: Some(target.to_string()),
        value: None,
        options: json!({ "delay_ms": delay_ms }),
    }
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_read_file_goal_completes_with_file_text() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "# Taskpilot\nPlans and runs goals.\n").unwrap();

        let planner = ScriptedPlanner::always(vec![
            Subtask::new("read", "Read the readme")
                .with_action(Action::tool("read_file", json!({ "path": "README.md" }))),
        ]);
        let reflector = FixedReflector::new(Verdict::Abort);
        let ledger = Arc::new(UsageLedger::new());
        let context = AgentContext::builder(fast_config())
            .planner(planner.clone())
            .reflector(reflector.clone())
            .memory(ledger.clone())
            .build()
            .unwrap();
        context
            .providers
            .adopt("files", serve("files", Files::new(dir.path())).await)
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(Arc::new(context));

        let result = orchestrator.execute_task("read file README.md").await;

        assert_eq!(result.status, TaskStatus::Succeeded, "{}", result.rationale);
        assert_eq!(result.output, Some(json!("# Taskpilot\nPlans and runs goals.\n")));
        assert_eq!(result.subtasks.len(), 1);
        assert_eq!(result.subtasks[0].status, SubtaskStatus::Succeeded);
        assert_eq!(result.subtasks[0].results[0].backend, "provider:files");
        // Success never consults the reflection service
        assert_eq!(reflector.consulted(), 0);
        // The planner saw the discovered tool
        assert!(planner.requests()[0].tools.iter().any(|t| t.name == "read_file"));

        assert_eq!(ledger.archived().len(), 1);
        assert!(eventually(|| ledger.tool_stats("read_file").is_some()).await);
    }

    #[tokio::test]
    async fn test_unreachable_provider_falls_back_to_gui() {
        let mut provider = ProviderConfig::new("/nonexistent/taskpilot-browser-provider")
            .with_required_tools(["navigate"])
            .with_fallback(FallbackBackend::Gui);
        provider.connect_retries = 0;
        let mut config = fast_config();
        config.providers = HashMap::from([("browser".to_string(), provider)]);

        let planner = ScriptedPlanner::always(vec![
            Subtask::new("open", "Open the site").with_action(Action::tool(
                "navigate",
                json!({ "target": "https://example.com" }),
            )),
        ]);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(config, planner, FixedReflector::new(Verdict::Abort), gui.clone());

        let reports = orchestrator.context().start_providers().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].error.is_some());

        let result = orchestrator.execute_task("open example.com").await;
        assert_eq!(result.status, TaskStatus::Succeeded, "{}", result.rationale);
        assert_eq!(result.subtasks[0].results[0].backend, "gui");
        assert_eq!(gui.calls("navigate"), 1);
    }

    #[tokio::test]
    async fn test_independent_subtasks_finish_before_their_dependent_starts() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("a", "First half").with_action(mark("a", 50)),
            Subtask::new("b", "Second half").with_action(mark("b", 50)),
            Subtask::new("c", "Combine")
                .with_action(mark("c", 0))
                .with_dependency("a")
                .with_dependency("b"),
        ]);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            gui.clone(),
        );

        let result = orchestrator.execute_task("two halves then combine").await;
        assert_eq!(result.status, TaskStatus::Succeeded, "{}", result.rationale);

        // a and b ran side by side
        assert!(gui.position("start:b") < gui.position("end:a"));
        assert!(gui.position("start:a") < gui.position("end:b"));
        // c waited for both
        assert!(gui.position("start:c") > gui.position("end:a"));
        assert!(gui.position("start:c") > gui.position("end:b"));
        assert_eq!(result.output, Some(json!("c")));
    }

    #[tokio::test]
    async fn test_exhausted_retry_budget_consults_reflection_once_and_replans() {
        let mut config = fast_config();
        config.execution.subtask_retry_budget = 3;
        config.execution.max_replans = 1;

        let planner = ScriptedPlanner::always(vec![
            Subtask::new("submit", "Submit the form").with_action(Action::gui("flaky", Some("#submit"))),
        ]);
        let reflector = FixedReflector::new(Verdict::Replan);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(config, planner.clone(), reflector.clone(), gui.clone());

        let result = orchestrator.execute_task("submit the form").await;

        // Round 0: three failed runs, then the service picks replan.
        // Round 1: three failed runs, then the replan cap forces failure.
        assert_eq!(reflector.consulted(), 1);
        assert_eq!(gui.calls("flaky"), 6);
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.replans, 1);

        let requests = planner.requests();
        assert_eq!(requests.len(), 2);
        let context = requests[1].context.as_ref().unwrap();
        assert_eq!(context.round, 1);
        assert_eq!(context.failures.len(), 3);
        assert!(context.failures.iter().all(|f| f.subtask.as_deref() == Some("submit")));
        assert_eq!(
            context.signal.as_ref().and_then(|s| s.failing_tool.clone()),
            None
        );
        assert_eq!(context.completed[0].runs, 3);
    }

    #[tokio::test]
    async fn test_planner_sees_similar_archived_tasks() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("open", "Open the settings page").with_action(mark("settings", 0)),
        ]);
        let ledger = Arc::new(UsageLedger::new());
        let context = AgentContext::builder(fast_config())
            .planner(planner.clone())
            .reflector(FixedReflector::new(Verdict::Abort))
            .gui(ScriptedGui::new())
            .memory(ledger.clone())
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(Arc::new(context));

        let first = orchestrator.execute_task("open the settings page").await;
        assert!(first.is_success());
        let second = orchestrator.execute_task("open settings and enable dark mode").await;
        assert!(second.is_success());
        let third = orchestrator.execute_task("compile kernel sources").await;
        assert!(third.is_success());

        let requests = planner.requests();
        assert!(requests[0].similar.is_empty());

        let similar = &requests[1].similar;
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].goal, "open the settings page");
        assert_eq!(similar[0].status, TaskStatus::Succeeded);
        assert_eq!(similar[0].steps, vec!["Open the settings page"]);

        assert!(requests[2].similar.is_empty());
    }
}

mod bound_tests {
    use super::*;

    #[tokio::test]
    async fn test_always_replan_stops_after_max_replans() {
        let mut config = fast_config();
        config.execution.max_replans = 2;

        let planner = ScriptedPlanner::always(vec![
            Subtask::new("x", "Doomed").with_action(Action::gui("deny", None)),
        ]);
        let reflector = FixedReflector::new(Verdict::Replan);
        let orchestrator = orchestrator(config, planner.clone(), reflector.clone(), ScriptedGui::new());

        let result = orchestrator.execute_task("never works").await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.replans, 2);
        assert_eq!(planner.requests().len(), 3);
        assert_eq!(reflector.consulted(), 2);
        assert_eq!(
            result.failure_chain.last().map(|f| f.kind),
            Some(FailureKind::ReflectionAbort)
        );
    }

    #[tokio::test]
    async fn test_fatal_action_stops_the_subtask() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("x", "Deny then mark")
                .with_action(Action::gui("deny", None))
                .with_action(mark("after", 0)),
        ]);
        let gui = ScriptedGui::new();
        let context = AgentContext::builder(fast_config())
            .planner(planner)
            .reflector(Arc::new(HeuristicReflector))
            .gui(gui.clone())
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(Arc::new(context));

        let result = orchestrator.execute_task("deny").await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(gui.calls("deny"), 1);
        assert_eq!(gui.calls("mark"), 0);
        assert_eq!(result.subtasks[0].results.len(), 1);
        let kinds: Vec<_> = result.failure_chain.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::Execution, FailureKind::ReflectionAbort]);
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn test_invalid_plan_fails_before_execution() {
        let planner = ScriptedPlanner::new(vec![Ok(plan(vec![
            Subtask::new("a", "A").with_action(mark("a", 0)).with_dependency("b"),
            Subtask::new("b", "B").with_action(mark("b", 0)).with_dependency("a"),
        ]))]);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(fast_config(), planner, FixedReflector::new(Verdict::Abort), gui.clone());

        let result = orchestrator.execute_task("cyclic").await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.rationale.contains("cycle"), "{}", result.rationale);
        assert_eq!(result.failure_chain[0].kind, FailureKind::Planning);
        assert!(gui.log().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_in_plan_is_rejected() {
        let planner = ScriptedPlanner::new(vec![Err(PlanningError::Service("model offline".to_string()))]);
        let offline = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        );
        let result = offline.execute_task("anything").await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.rationale.contains("model offline"));

        let planner = ScriptedPlanner::always(vec![
            Subtask::new("a", "A").with_action(Action::tool("teleport", json!({}))),
        ]);
        let confused = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        );
        let result = confused.execute_task("teleport").await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.rationale.contains("teleport"));
    }

    #[tokio::test]
    async fn test_empty_subtask_succeeds_vacuously() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("noop", "Nothing to do"),
            Subtask::new("after", "Then mark").with_action(mark("after", 0)).with_dependency("noop"),
        ]);
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        );

        let result = orchestrator.execute_task("noop then mark").await;
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.output, Some(json!("after")));
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_stops_a_hanging_task() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("wait", "Wait forever")
                .with_action(Action::gui("hang", None))
                .with_action(mark("never", 0)),
        ]);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            gui.clone(),
        );

        let handle = orchestrator.spawn_task("hang around");
        let id = handle.id.clone();
        assert!(eventually(|| gui.calls("hang") == 1).await);
        assert_eq!(orchestrator.phase(&id), Some(Phase::Executing));
        assert_eq!(orchestrator.running_tasks().len(), 1);

        orchestrator.cancel_task(&id).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cancelled task should finish")
            .unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.subtasks[0].status, SubtaskStatus::Cancelled);
        assert_eq!(gui.calls("mark"), 0);
        assert!(orchestrator.running_tasks().is_empty());
        assert!(matches!(orchestrator.cancel_task(&id), Err(Error::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_leaves_unrelated_providers_running() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "still here").unwrap();
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("wait", "Wait forever").with_action(Action::gui("hang", None)),
        ]);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            gui.clone(),
        );
        let providers = Arc::clone(&orchestrator.context().providers);
        providers
            .adopt("files", serve("files", Files::new(dir.path())).await)
            .await
            .unwrap();

        let handle = orchestrator.spawn_task("hang around");
        let id = handle.id.clone();
        assert!(eventually(|| gui.calls("hang") == 1).await);
        orchestrator.cancel_task(&id).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cancelled task should finish")
            .unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        let cut_off = result.subtasks[0].results[0].error.as_ref().unwrap();
        assert_eq!(cut_off.kind, FailureKind::Cancelled);

        // The GUI call was cut off; the file provider was never touched
        assert!(orchestrator.context().registry.contains("read_file"));
        assert_eq!(providers.status("files"), Some(ProviderStatus::Running));
        let text = providers
            .call("files", "read_file", json!({ "path": "notes.txt" }), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text.text().as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn test_cancel_closes_only_the_provider_a_call_is_stuck_on() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "still here").unwrap();
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("wait", "Wait on the slow provider")
                .with_action(Action::tool("wait", json!({})))
                .with_action(mark("never", 0)),
        ]);
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            gui.clone(),
        );
        let providers = Arc::clone(&orchestrator.context().providers);
        let stall = Stall::new();
        providers
            .adopt("files", serve("files", Files::new(dir.path())).await)
            .await
            .unwrap();
        providers.adopt("slow", serve("slow", stall.clone()).await).await.unwrap();

        let handle = orchestrator.spawn_task("wait on the slow provider");
        let id = handle.id.clone();
        assert!(eventually(|| stall.calls() == 1).await);
        orchestrator.cancel_task(&id).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cancelled task should finish")
            .unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        let report = &result.subtasks[0];
        assert_eq!(report.status, SubtaskStatus::Cancelled);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].backend, "provider:slow");
        assert_eq!(report.results[0].error.as_ref().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(gui.calls("mark"), 0);

        // An adopted session cannot be respawned, so it stays down
        assert_eq!(providers.status("slow"), Some(ProviderStatus::Stopped));
        assert!(!orchestrator.context().registry.contains("wait"));

        assert_eq!(providers.status("files"), Some(ProviderStatus::Running));
        let text = providers
            .call("files", "read_file", json!({ "path": "notes.txt" }), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text.text().as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task() {
        let orchestrator = orchestrator(
            fast_config(),
            ScriptedPlanner::always(vec![]),
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        );
        assert!(matches!(orchestrator.cancel_task("nope"), Err(Error::TaskNotFound(_))));
    }
}

mod pause_tests {
    use super::*;

    fn two_step_plan() -> Arc<ScriptedPlanner> {
        ScriptedPlanner::always(vec![
            Subtask::new("a", "First").with_action(mark("a", 200)),
            Subtask::new("b", "Second").with_action(mark("b", 0)).with_dependency("a"),
        ])
    }

    #[tokio::test]
    async fn test_paused_task_holds_back_new_subtasks_until_resumed() {
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(
            fast_config(),
            two_step_plan(),
            FixedReflector::new(Verdict::Abort),
            gui.clone(),
        );

        let handle = orchestrator.spawn_task("two steps");
        let id = handle.id.clone();
        assert!(eventually(|| gui.log().contains(&"start:a".to_string())).await);
        orchestrator.pause_task(&id).unwrap();

        // The running subtask finishes; the next one waits
        assert!(eventually(|| gui.log().contains(&"end:a".to_string())).await);
        assert!(eventually(|| orchestrator.phase(&id) == Some(Phase::Paused)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gui.calls("mark"), 1);
        assert_eq!(orchestrator.phase(&id), Some(Phase::Paused));

        orchestrator.resume_task(&id).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("resumed task should finish")
            .unwrap();

        assert_eq!(result.status, TaskStatus::Succeeded, "{}", result.rationale);
        assert!(gui.position("start:b") > gui.position("end:a"));
    }

    #[tokio::test]
    async fn test_paused_task_can_be_cancelled() {
        let gui = ScriptedGui::new();
        let orchestrator = orchestrator(
            fast_config(),
            two_step_plan(),
            FixedReflector::new(Verdict::Abort),
            gui.clone(),
        );

        let handle = orchestrator.spawn_task("two steps");
        let id = handle.id.clone();
        orchestrator.pause_task(&id).unwrap();
        assert!(eventually(|| orchestrator.phase(&id) == Some(Phase::Paused)).await);

        orchestrator.cancel_task(&id).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cancelled task should finish")
            .unwrap();

        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(gui.calls("mark"), 0);
        assert!(result.subtasks.iter().all(|s| s.status == SubtaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_pause_unknown_task() {
        let orchestrator = orchestrator(
            fast_config(),
            ScriptedPlanner::always(vec![]),
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        );
        assert!(matches!(orchestrator.pause_task("nope"), Err(Error::TaskNotFound(_))));
        assert!(matches!(orchestrator.resume_task("nope"), Err(Error::TaskNotFound(_))));
    }
}

mod event_tests {
    use super::*;

    #[tokio::test]
    async fn test_events_follow_the_task() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("a", "Mark").with_action(mark("a", 0)),
        ]);
        let (tx, mut rx) = mpsc::channel(64);
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        )
        .with_events(tx);

        let result = orchestrator.execute_task("mark a").await;
        assert!(result.is_success());
        drop(orchestrator);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert!(matches!(
            events.first(),
            Some(TaskEvent::PhaseChanged { phase: Phase::Planning, .. })
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::Reflected { verdict: Verdict::Continue, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            TaskEvent::PhaseChanged { phase: Phase::Completed, .. }
        )));
        assert!(matches!(
            events.last(),
            Some(TaskEvent::Finished { status: TaskStatus::Succeeded, .. })
        ));
    }

    #[tokio::test]
    async fn test_stalled_listener_does_not_block_the_task() {
        let planner = ScriptedPlanner::always(vec![
            Subtask::new("a", "Mark").with_action(mark("a", 0)),
            Subtask::new("b", "Mark").with_action(mark("b", 0)).with_dependency("a"),
        ]);
        // Room for one event, and nobody reads it
        let (tx, mut rx) = mpsc::channel(1);
        let orchestrator = orchestrator(
            fast_config(),
            planner,
            FixedReflector::new(Verdict::Abort),
            ScriptedGui::new(),
        )
        .with_events(tx);

        let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.execute_task("mark both"))
            .await
            .expect("task should not wait on the listener");
        assert!(result.is_success());
        drop(orchestrator);

        assert!(matches!(
            rx.recv().await,
            Some(TaskEvent::PhaseChanged { phase: Phase::Planning, .. })
        ));
        assert!(rx.recv().await.is_none());
    }
}
