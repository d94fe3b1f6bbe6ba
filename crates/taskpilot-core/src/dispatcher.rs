//! Action dispatcher
//!
//! Resolves an [`Action`] to a backend and runs it under a timeout with a
//! bounded number of retries. Only transient failures are retried; a fatal
//! failure ends the dispatch at once.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use serde_json::Value;
use taskpilot_mcp::ToolCallResult;

use crate::backend::{CodeBackend, CodeRequest, GuiBackend, GuiRequest, Unavailable};
use crate::error::{ActionFailure, ErrorClass, ExecutionError, FailureKind};
use crate::memory::{MemorySink, ToolUsage};
use crate::providers::{ProviderManager, ProviderReport};
use crate::registry::{BackendRef, ToolDescriptor, ToolRegistry, validate_arguments};
use crate::task::{Action, ActionResult, CodeMode};

/// Backoff never grows past this multiple of the base delay
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Provider calls in flight on behalf of one task, counted per provider
#[derive(Debug, Default)]
pub struct InFlightCalls {
    counts: Mutex<HashMap<String, usize>>,
}

impl InFlightCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(self: &Arc<Self>, provider: &str) -> InFlightGuard {
        *self.counts.lock().entry(provider.to_string()).or_default() += 1;
        InFlightGuard {
            calls: Arc::clone(self),
            provider: provider.to_string(),
        }
    }

    /// Providers with at least one call still waiting, sorted
    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.counts.lock().keys().cloned().collect();
        providers.sort();
        providers
    }
}

/// Leaves the count on drop, so calls aborted mid-flight are not left behind
struct InFlightGuard {
    calls: Arc<InFlightCalls>,
    provider: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counts = self.calls.counts.lock();
        if let Some(count) = counts.get_mut(&self.provider) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.provider);
            }
        }
    }
}

pub struct ActionDispatcher {
    registry: Arc<ToolRegistry>,
    providers: Arc<ProviderManager>,
    gui: Arc<dyn GuiBackend>,
    code: Arc<dyn CodeBackend>,
    memory: Option<Arc<dyn MemorySink>>,
    /// Tool name -> built-in backend standing in for its provider
    fallbacks: RwLock<HashMap<String, BackendRef>>,
    retry_delay: Duration,
}

impl ActionDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, providers: Arc<ProviderManager>) -> Self {
        Self {
            registry,
            providers,
            gui: Arc::new(Unavailable),
            code: Arc::new(Unavailable),
            memory: None,
            fallbacks: RwLock::new(HashMap::new()),
            retry_delay: Duration::from_millis(250),
        }
    }

    pub fn with_gui(mut self, gui: Arc<dyn GuiBackend>) -> Self {
        self.gui = gui;
        self
    }

    pub fn with_code(mut self, code: Arc<dyn CodeBackend>) -> Self {
        self.code = code;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Base delay between attempts; doubles after each retry
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn providers(&self) -> &Arc<ProviderManager> {
        &self.providers
    }

    /// Route a tool to a built-in backend whenever its provider cannot serve it
    pub fn set_fallback(&self, tool: impl Into<String>, backend: BackendRef) {
        self.fallbacks.write().insert(tool.into(), backend);
    }

    pub fn fallback_for(&self, tool: &str) -> Option<BackendRef> {
        self.fallbacks.read().get(tool).cloned()
    }

    /// Record fallbacks for every provider that has one configured and
    /// register fallback descriptors for the required tools a degraded
    /// provider does not serve. Returns how many descriptors were added.
    pub fn install_fallbacks(&self, reports: &[ProviderReport]) -> usize {
        let mut installed = 0;
        for report in reports {
            let Some(fallback) = report.fallback else {
                continue;
            };
            let backend = BackendRef::from(fallback);

            for tool in &report.required_tools {
                self.set_fallback(tool.clone(), backend.clone());
            }
            if !report.is_degraded() {
                continue;
            }

            for tool in &report.missing_tools {
                if self.registry.contains(tool) {
                    continue;
                }
                tracing::warn!(
                    provider = %report.name,
                    tool = %tool,
                    fallback = %backend,
                    "Substituting fallback backend for provider tool"
                );
                self.registry.register(
                    ToolDescriptor::new(tool.clone(), backend.clone())
                        .with_description(format!("{} (fallback for {})", tool, report.name)),
                );
                installed += 1;
            }
        }
        installed
    }

    /// Execute an action, retrying transient failures up to `max_retries`
    /// times. Each attempt gets the full `timeout`.
    pub async fn dispatch(&self, action: &Action, timeout: Duration, max_retries: u32) -> ActionResult {
        self.dispatch_tracked(action, timeout, max_retries, None).await
    }

    /// Like [`dispatch`](Self::dispatch), counting provider calls in `calls`
    /// while they wait
    pub async fn dispatch_tracked(
        &self,
        action: &Action,
        timeout: Duration,
        max_retries: u32,
        calls: Option<&Arc<InFlightCalls>>,
    ) -> ActionResult {
        let action = self.canonical(action);
        let action = action.as_ref();
        let started = Instant::now();
        let mut delay = self.retry_delay;
        let max_delay = self.retry_delay * MAX_BACKOFF_FACTOR;
        let mut attempts = 0;

        let (backend, outcome) = loop {
            attempts += 1;
            let (backend, outcome) = self.attempt(action, timeout, calls).await;

            match outcome {
                Err(failure) if failure.is_transient() && attempts <= max_retries => {
                    tracing::warn!(
                        action = %action.label(),
                        %backend,
                        attempt = attempts,
                        error = %failure.message,
                        "Transient action failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
                outcome => break (backend, outcome),
            }
        };

        let mut result = match outcome {
            Ok(output) => ActionResult::succeeded(action.clone(), output, backend),
            Err(failure) => {
                tracing::debug!(
                    action = %action.label(),
                    %backend,
                    attempts,
                    class = ?failure.class,
                    error = %failure.message,
                    "Action failed"
                );
                ActionResult::failed(action.clone(), failure, backend)
            }
        };
        result.attempts = attempts;
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        self.record_usage(&result);
        result
    }

    /// One attempt, including at most one re-route to a fallback backend.
    /// The re-route runs within what is left of the attempt's timeout.
    async fn attempt(
        &self,
        action: &Action,
        timeout: Duration,
        calls: Option<&Arc<InFlightCalls>>,
    ) -> (String, Result<Value, ActionFailure>) {
        let backend = match self.route(action) {
            Ok(backend) => backend,
            Err((label, failure)) => return (label, Err(failure)),
        };

        let deadline = Instant::now() + timeout;
        let outcome = self.run_until(action, &backend, timeout, deadline, calls).await;

        if let (Err(failure), BackendRef::Provider(provider), Some(tool)) =
            (&outcome, &backend, action.tool_name())
            && failure.kind == FailureKind::Protocol
            && failure.class == ErrorClass::Fatal
            && let Some(fallback) = self.fallback_for(tool)
        {
            tracing::warn!(
                tool = %tool,
                provider = %provider,
                %fallback,
                error = %failure.message,
                "Provider failed, re-routing to fallback backend"
            );
            let outcome = self.run_until(action, &fallback, timeout, deadline, calls).await;
            return (fallback.to_string(), outcome);
        }

        (backend.to_string(), outcome)
    }

    /// The action with its tool name replaced by the registered one it
    /// stands for
    fn canonical<'b>(&self, action: &'b Action) -> Cow<'b, Action> {
        let Action::Tool { name, arguments } = action else {
            return Cow::Borrowed(action);
        };
        match self.registry.canonical_name(name) {
            Some(canonical) if canonical != *name => {
                tracing::warn!(tool = %name, %canonical, "Tool not registered under this name, using alias target");
                Cow::Owned(Action::Tool {
                    name: canonical,
                    arguments: arguments.clone(),
                })
            }
            _ => Cow::Borrowed(action),
        }
    }

    /// Label of the backend an action routes to right now
    pub fn backend_for(&self, action: &Action) -> String {
        match self.route(action) {
            Ok(backend) => backend.to_string(),
            Err((label, _)) => label,
        }
    }

    fn route(&self, action: &Action) -> Result<BackendRef, (String, ActionFailure)> {
        let (name, arguments) = match action {
            Action::Gui { .. } => return Ok(BackendRef::Gui),
            Action::Code { .. } => return Ok(BackendRef::Code),
            Action::Tool { name, arguments } => (name, arguments),
        };

        match self.registry.resolve(name) {
            Ok(descriptor) => {
                if matches!(descriptor.backend, BackendRef::Provider(_)) {
                    validate_arguments(&descriptor.parameters, arguments).map_err(|e| {
                        (
                            descriptor.backend.to_string(),
                            ActionFailure::execution(ExecutionError::fatal(format!(
                                "invalid arguments for '{}': {}",
                                name, e
                            ))),
                        )
                    })?;
                }
                Ok(descriptor.backend)
            }
            Err(_) => match self.fallback_for(name) {
                Some(fallback) => Ok(fallback),
                None => Err((
                    "unresolved".to_string(),
                    ActionFailure::execution(ExecutionError::fatal(format!(
                        "tool '{}' is not registered",
                        name
                    ))),
                )),
            },
        }
    }

    async fn run_until(
        &self,
        action: &Action,
        backend: &BackendRef,
        timeout: Duration,
        deadline: Instant,
        calls: Option<&Arc<InFlightCalls>>,
    ) -> Result<Value, ActionFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ActionFailure::timeout(timeout));
        }
        match tokio::time::timeout_at(deadline, self.run(action, backend, remaining, calls)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ActionFailure::timeout(timeout)),
        }
    }

    async fn run(
        &self,
        action: &Action,
        backend: &BackendRef,
        timeout: Duration,
        calls: Option<&Arc<InFlightCalls>>,
    ) -> Result<Value, ActionFailure> {
        match (action, backend) {
            (
                Action::Gui {
                    operation,
                    target,
                    value,
                    options,
                },
                _,
            ) => self
                .gui
                .execute(GuiRequest {
                    operation: operation.clone(),
                    target: target.clone(),
                    value: value.clone(),
                    options: options.clone(),
                })
                .await
                .map_err(ActionFailure::execution),

            (Action::Code { language, source, mode }, _) => {
                self.run_code(CodeRequest {
                    language: language.clone(),
                    source: source.clone(),
                    mode: *mode,
                    timeout_ms: timeout.as_millis() as u64,
                })
                .await
            }

            (Action::Tool { name, arguments }, BackendRef::Provider(provider)) => {
                let _in_flight = calls.map(|calls| calls.enter(provider));
                let result = self
                    .providers
                    .call(provider, name, arguments.clone(), timeout)
                    .await
                    .map_err(|e| ActionFailure::protocol(&e))?;
                normalize_tool_result(result).map_err(ActionFailure::execution)
            }

            (Action::Tool { name, arguments }, BackendRef::Gui) => self
                .gui
                .execute(tool_as_gui(name, arguments))
                .await
                .map_err(ActionFailure::execution),

            (Action::Tool { arguments, .. }, BackendRef::Code) => {
                self.run_code(tool_as_code(arguments, timeout)).await
            }
        }
    }

    async fn run_code(&self, request: CodeRequest) -> Result<Value, ActionFailure> {
        let output = self.code.run(request).await.map_err(ActionFailure::execution)?;
        if output.success {
            return Ok(Value::String(output.stdout));
        }

        let message = if output.stderr.trim().is_empty() {
            match output.exit_code {
                Some(code) => format!("code exited with status {}", code),
                None => "code execution failed".to_string(),
            }
        } else {
            output.stderr.trim().to_string()
        };
        Err(ActionFailure::execution(ExecutionError::classified(message)))
    }

    fn record_usage(&self, result: &ActionResult) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        let usage = ToolUsage {
            tool: result.action.label(),
            backend: result.backend.clone(),
            success: result.success,
            elapsed_ms: result.elapsed_ms,
            attempts: result.attempts,
            class: result.error.as_ref().map(|e| e.class),
        };
        tokio::spawn(async move {
            memory.record_tool_usage(usage).await;
        });
    }
}

/// Text content if any, else structured content, else the raw result.
/// A result flagged as an error becomes a classified execution error.
pub fn normalize_tool_result(result: ToolCallResult) -> Result<Value, ExecutionError> {
    if result.is_error {
        let message = result
            .text()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "tool reported an error".to_string());
        return Err(ExecutionError::classified(message));
    }
    if let Some(text) = result.text() {
        return Ok(Value::String(text));
    }
    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }
    serde_json::to_value(&result).map_err(|e| ExecutionError::fatal(e.to_string()))
}

fn tool_as_gui(name: &str, arguments: &Value) -> GuiRequest {
    GuiRequest {
        operation: name.to_string(),
        target: arguments
            .get("target")
            .or_else(|| arguments.get("selector"))
            .and_then(Value::as_str)
            .map(str::to_string),
        value: arguments.get("value").cloned(),
        options: arguments.clone(),
    }
}

fn tool_as_code(arguments: &Value, timeout: Duration) -> CodeRequest {
    let source = arguments
        .get("source")
        .or_else(|| arguments.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mode = match arguments.get("mode").and_then(Value::as_str) {
        Some("expression") => CodeMode::Expression,
        _ => CodeMode::Script,
    };
    CodeRequest {
        language: arguments
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("python")
            .to_string(),
        source: source.to_string(),
        mode,
        timeout_ms: timeout.as_millis() as u64,
    }
}
