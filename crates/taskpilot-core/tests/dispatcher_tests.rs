//! Action dispatcher integration tests
//!
//! Routing, retry bounds, timeouts, provider calls and fallbacks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use taskpilot_core::config::FallbackBackend;
use taskpilot_core::memory::UsageLedger;
use taskpilot_core::{
    Action, ActionDispatcher, BackendRef, ErrorClass, FailureKind, ProviderManager, ProviderReport,
    ProviderStatus, ToolDescriptor, ToolRegistry,
};

use taskpilot_mcp::{Session, SessionOptions};

use common::{EchoCode, Files, ScriptedGui, eventually, serve};

struct Fixture {
    registry: Arc<ToolRegistry>,
    providers: Arc<ProviderManager>,
    gui: Arc<ScriptedGui>,
    code: Arc<EchoCode>,
    dispatcher: ActionDispatcher,
}

fn fixture() -> Fixture {
    let registry = Arc::new(ToolRegistry::new());
    let providers = Arc::new(ProviderManager::new(Arc::clone(&registry)));
    let gui = ScriptedGui::new();
    let code = Arc::new(EchoCode::default());
    let dispatcher = ActionDispatcher::new(Arc::clone(&registry), Arc::clone(&providers))
        .with_gui(gui.clone())
        .with_code(code.clone())
        .with_retry_delay(Duration::from_millis(1));

    Fixture {
        registry,
        providers,
        gui,
        code,
        dispatcher,
    }
}

fn workspace() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    std::fs::write(dir.path().join("README.md"), "# Taskpilot\n").unwrap();
    dir
}

const TIMEOUT: Duration = Duration::from_secs(5);

mod retry_tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_failure_is_attempted_max_retries_plus_one() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&Action::gui("flaky", Some("#submit")), TIMEOUT, 3)
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.retries(), 3);
        assert_eq!(f.gui.calls("flaky"), 4);
        assert_eq!(result.error.unwrap().class, ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&Action::gui("deny", None), TIMEOUT, 5)
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(f.gui.calls("deny"), 1);
        assert_eq!(result.error.unwrap().class, ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_retried() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&Action::gui("hang", None), Duration::from_millis(50), 1)
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        let failure = result.error.unwrap();
        assert_eq!(failure.class, ErrorClass::Transient);
        assert!(failure.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_success_uses_one_attempt() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&Action::code("python", "print(1)"), TIMEOUT, 2)
            .await;

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.backend, "code");
        assert_eq!(result.output, json!("python:print(1)"));
        assert_eq!(f.code.requests.lock()[0].timeout_ms, 5000);
    }
}

mod provider_tests {
    use super::*;

    #[tokio::test]
    async fn test_tool_action_calls_provider() {
        let f = fixture();
        let dir = workspace();
        let files = Files::new(dir.path());
        f.providers
            .adopt("files", serve("files", files.clone()).await)
            .await
            .unwrap();

        let result = f
            .dispatcher
            .dispatch(
                &Action::tool("read_file", json!({ "path": "README.md" })),
                TIMEOUT,
                0,
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output, json!("# Taskpilot\n"));
        assert_eq!(result.backend, "provider:files");
        assert_eq!(files.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_aliases_reach_the_registered_tool() {
        let f = fixture();
        let dir = workspace();
        let files = Files::new(dir.path());
        f.providers
            .adopt("files", serve("files", files.clone()).await)
            .await
            .unwrap();
        f.registry.add_alias("cat", "read_file");

        for name in ["Read-File", "cat"] {
            let result = f
                .dispatcher
                .dispatch(&Action::tool(name, json!({ "path": "README.md" })), TIMEOUT, 0)
                .await;
            assert!(result.success, "{}: {:?}", name, result.error);
            assert_eq!(result.action.tool_name(), Some("read_file"));
            assert_eq!(result.output, json!("# Taskpilot\n"));
        }
        assert_eq!(files.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_without_calling_provider() {
        let f = fixture();
        let files = Files::new(workspace().path());
        f.providers
            .adopt("files", serve("files", files.clone()).await)
            .await
            .unwrap();

        let result = f
            .dispatcher
            .dispatch(&Action::tool("read_file", json!({ "path": 7 })), TIMEOUT, 3)
            .await;

        let failure = result.error.unwrap();
        assert_eq!(failure.class, ErrorClass::Fatal);
        assert!(failure.message.contains("invalid arguments"));
        assert_eq!(result.attempts, 1);
        assert_eq!(files.calls(), 0);
    }

    #[tokio::test]
    async fn test_tool_error_result_is_classified() {
        let f = fixture();
        let dir = workspace();
        f.providers
            .adopt("files", serve("files", Files::new(dir.path())).await)
            .await
            .unwrap();

        let result = f
            .dispatcher
            .dispatch(
                &Action::tool("read_file", json!({ "path": "missing.md" })),
                TIMEOUT,
                2,
            )
            .await;

        assert!(!result.success);
        let failure = result.error.unwrap();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.message.contains("cannot read missing.md"));
    }

    #[tokio::test]
    async fn test_unregistered_tool_fails_fatal() {
        let f = fixture();
        let result = f
            .dispatcher
            .dispatch(&Action::tool("navigate", json!({})), TIMEOUT, 3)
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error.unwrap().class, ErrorClass::Fatal);
    }
}

mod fallback_tests {
    use super::*;

    /// Provider serving a `hang` tool that refuses every call after `delay`
    async fn refusing_provider(delay: Duration) -> Arc<Session> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = serde_json::from_str(&line).unwrap();
                let id = message["id"].clone();
                let reply = match message["method"].as_str() {
                    Some("initialize") => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": "2024-11-05",
                            "capabilities": { "tools": {} },
                            "serverInfo": { "name": "refusing", "version": "0.0.1" }
                        }
                    }),
                    Some("tools/list") => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "tools": [{
                            "name": "hang",
                            "description": "Never works",
                            "inputSchema": { "type": "object" }
                        }] }
                    }),
                    Some("tools/call") => {
                        tokio::time::sleep(delay).await;
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32601, "message": "Method not found" }
                        })
                    }
                    _ => continue,
                };
                if write.write_all(format!("{}\n", reply).as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let (client_read, client_write) = tokio::io::split(client);
        let session = Arc::new(Session::new("refusing", SessionOptions::default()));
        session
            .connect_streams(client_read, client_write)
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_fallback_runs_within_the_remaining_timeout() {
        let f = fixture();
        f.providers
            .adopt("refusing", refusing_provider(Duration::from_millis(300)).await)
            .await
            .unwrap();
        f.dispatcher.set_fallback("hang", BackendRef::Gui);

        let result = f
            .dispatcher
            .dispatch(&Action::tool("hang", json!({})), Duration::from_millis(500), 0)
            .await;

        assert!(!result.success);
        assert_eq!(result.backend, "gui");
        assert_eq!(f.gui.calls("hang"), 1);
        assert!(result.error.unwrap().message.contains("timed out"));
        // The provider used 300ms of the 500ms; the fallback got the rest
        assert!(result.elapsed_ms < 750, "took {}ms", result.elapsed_ms);
    }

    #[tokio::test]
    async fn test_fatal_protocol_failure_reroutes_to_fallback() {
        let f = fixture();
        // Descriptor for a provider that is not running
        f.registry
            .register(ToolDescriptor::new("navigate", BackendRef::Provider("browser".to_string())));
        f.dispatcher.set_fallback("navigate", BackendRef::Gui);

        let result = f
            .dispatcher
            .dispatch(
                &Action::tool("navigate", json!({ "target": "https://example.com" })),
                TIMEOUT,
                0,
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.backend, "gui");
        let requests = f.gui.requests.lock();
        assert_eq!(requests[0].operation, "navigate");
        assert_eq!(requests[0].target.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn test_install_fallbacks_for_failed_provider() {
        let f = fixture();
        let reports = vec![
            ProviderReport {
                name: "browser".to_string(),
                status: ProviderStatus::Failed("spawn failed".to_string()),
                tools: vec![],
                required_tools: vec!["navigate".to_string()],
                missing_tools: vec!["navigate".to_string()],
                error: Some("spawn failed".to_string()),
                fallback: Some(FallbackBackend::Gui),
            },
            ProviderReport {
                name: "python".to_string(),
                status: ProviderStatus::Failed("spawn failed".to_string()),
                tools: vec![],
                required_tools: vec!["run_python".to_string()],
                missing_tools: vec!["run_python".to_string()],
                error: Some("spawn failed".to_string()),
                fallback: Some(FallbackBackend::Code),
            },
            ProviderReport {
                name: "search".to_string(),
                status: ProviderStatus::Failed("spawn failed".to_string()),
                tools: vec![],
                required_tools: vec!["web_search".to_string()],
                missing_tools: vec!["web_search".to_string()],
                error: Some("spawn failed".to_string()),
                fallback: None,
            },
        ];

        assert_eq!(f.dispatcher.install_fallbacks(&reports), 2);
        assert_eq!(f.registry.resolve("navigate").unwrap().backend, BackendRef::Gui);
        assert!(!f.registry.contains("web_search"));

        let result = f
            .dispatcher
            .dispatch(
                &Action::tool("run_python", json!({ "code": "print(2)" })),
                TIMEOUT,
                0,
            )
            .await;
        assert!(result.success);
        assert_eq!(result.backend, "code");
        assert_eq!(result.output, json!("python:print(2)"));
    }

    #[tokio::test]
    async fn test_stopped_provider_falls_back_after_unregistering() {
        let f = fixture();
        f.providers
            .adopt("files", serve("files", Files::new(workspace().path())).await)
            .await
            .unwrap();
        f.dispatcher.set_fallback("read_file", BackendRef::Code);
        f.providers.stop("files").await.unwrap();
        assert!(!f.registry.contains("read_file"));

        let result = f
            .dispatcher
            .dispatch(
                &Action::tool("read_file", json!({ "code": "open('README.md').read()" })),
                TIMEOUT,
                0,
            )
            .await;
        assert!(result.success);
        assert_eq!(result.backend, "code");
    }
}

mod usage_tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_is_recorded() {
        let registry = Arc::new(ToolRegistry::new());
        let providers = Arc::new(ProviderManager::new(Arc::clone(&registry)));
        let ledger = Arc::new(UsageLedger::new());
        let dispatcher = ActionDispatcher::new(registry, providers)
            .with_gui(ScriptedGui::new())
            .with_memory(ledger.clone())
            .with_retry_delay(Duration::from_millis(1));

        dispatcher
            .dispatch(&Action::gui("click", Some("#ok")), TIMEOUT, 0)
            .await;
        dispatcher
            .dispatch(&Action::gui("flaky", None), TIMEOUT, 1)
            .await;

        assert!(eventually(|| ledger.all_stats().len() == 2).await);
        let click = ledger.tool_stats("gui:click").unwrap();
        assert_eq!(click.successes, 1);
        let flaky = ledger.tool_stats("gui:flaky").unwrap();
        assert_eq!(flaky.failures, 1);
    }
}
