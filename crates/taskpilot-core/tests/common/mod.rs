//! Test doubles shared by the core integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use taskpilot_core::backend::{CodeBackend, CodeOutput, CodeRequest, GuiBackend, GuiRequest};
use taskpilot_core::reflection::{Reflection, ReflectionRequest, ReflectionService, Verdict};
use taskpilot_core::task::{PlanRequest, PlanningService, ProposedPlan};
use taskpilot_core::{Config, ExecutionError, PlanningError, Subtask};
use taskpilot_mcp::server::{McpHandler, McpServer};
use taskpilot_mcp::{McpTool, Session, SessionOptions};

/// File tools rooted at a directory
pub struct Files {
    pub root: PathBuf,
    pub calls: AtomicUsize,
}

impl Files {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpHandler for Files {
    async fn list_tools(&self) -> Vec<McpTool> {
        vec![McpTool {
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            }),
        }]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match name {
            "read_file" => {
                let path = arguments["path"].as_str().unwrap_or_default();
                std::fs::read_to_string(self.root.join(path))
                    .map(Value::String)
                    .map_err(|e| format!("cannot read {}: {}", path, e))
            }
            other => Err(format!("unknown tool {}", other)),
        }
    }
}

/// Tool provider whose `wait` tool takes a minute to answer
#[derive(Default)]
pub struct Stall {
    pub calls: AtomicUsize,
}

impl Stall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpHandler for Stall {
    async fn list_tools(&self) -> Vec<McpTool> {
        vec![McpTool {
            name: "wait".to_string(),
            description: "Wait for a long time".to_string(),
            input_schema: json!({ "type": "object" }),
        }]
    }

    async fn call_tool(&self, _name: &str, _arguments: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    }
}

/// A session connected to `handler` over an in-process stream
pub async fn serve<H>(name: &str, handler: Arc<H>) -> Arc<Session>
where
    H: McpHandler + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    tokio::spawn(Arc::new(McpServer::new(handler)).serve(server_read, server_write));

    let (client_read, client_write) = tokio::io::split(client);
    let session = Arc::new(Session::new(name, SessionOptions::default()));
    session
        .connect_streams(client_read, client_write)
        .await
        .unwrap();
    session
}

/// GUI backend whose behavior is chosen by the operation name:
/// `mark` logs start/end around an optional delay, `flaky` always fails
/// transiently, `deny` fails fatally, `hang` never answers in time.
#[derive(Default)]
pub struct ScriptedGui {
    pub log: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<GuiRequest>>,
}

impl ScriptedGui {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.operation == operation)
            .count()
    }

    pub fn position(&self, entry: &str) -> usize {
        self.log()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not in log", entry))
    }
}

#[async_trait]
impl GuiBackend for ScriptedGui {
    async fn execute(&self, request: GuiRequest) -> Result<Value, ExecutionError> {
        self.requests.lock().push(request.clone());
        let target = request.target.clone().unwrap_or_default();

        match request.operation.as_str() {
            "mark" => {
                self.log.lock().push(format!("start:{}", target));
                let delay = request.options["delay_ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                self.log.lock().push(format!("end:{}", target));
                Ok(Value::String(target))
            }
            "flaky" => Err(ExecutionError::transient("element not visible")),
            "deny" => Err(ExecutionError::fatal("permission denied")),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
            other => Ok(json!({ "operation": other, "target": request.target })),
        }
    }
}

/// Code backend that echoes its source
#[derive(Default)]
pub struct EchoCode {
    pub requests: Mutex<Vec<CodeRequest>>,
}

#[async_trait]
impl CodeBackend for EchoCode {
    async fn run(&self, request: CodeRequest) -> Result<CodeOutput, ExecutionError> {
        self.requests.lock().push(request.clone());
        Ok(CodeOutput {
            success: true,
            stdout: format!("{}:{}", request.language, request.source),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }
}

/// Planner that hands out scripted plans, repeating the last one
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Result<ProposedPlan, PlanningError>>>,
    last: Mutex<Option<Result<ProposedPlan, PlanningError>>>,
    pub requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Result<ProposedPlan, PlanningError>>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn always(subtasks: Vec<Subtask>) -> Arc<Self> {
        Self::new(vec![Ok(plan(subtasks))])
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PlanningService for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<ProposedPlan, PlanningError> {
        self.requests.lock().push(request.clone());
        let next = self.plans.lock().pop_front();
        match next {
            Some(plan) => {
                *self.last.lock() = Some(plan.clone());
                plan
            }
            None => self
                .last
                .lock()
                .clone()
                .unwrap_or(Err(PlanningError::Service("no plan scripted".to_string()))),
        }
    }
}

pub fn plan(subtasks: Vec<Subtask>) -> ProposedPlan {
    ProposedPlan {
        summary: None,
        subtasks,
    }
}

/// Reflection service that always gives the same verdict
pub struct FixedReflector {
    verdict: Verdict,
    pub consulted: AtomicUsize,
}

impl FixedReflector {
    pub fn new(verdict: Verdict) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            consulted: AtomicUsize::new(0),
        })
    }

    pub fn consulted(&self) -> usize {
        self.consulted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReflectionService for FixedReflector {
    async fn reflect(&self, request: &ReflectionRequest) -> Result<Reflection, String> {
        self.consulted.fetch_add(1, Ordering::SeqCst);
        Ok(Reflection::new(
            self.verdict.clone(),
            format!("scripted verdict for {}", request.outcome.subtask_id),
        ))
    }
}

/// Defaults with fast retries
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.execution.retry_delay_ms = 1;
    config.execution.max_action_retries = 0;
    config.execution.action_timeout_secs = 5;
    config.execution.cancel_grace_ms = 100;
    config
}

/// Wait for a condition that is reached asynchronously
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
