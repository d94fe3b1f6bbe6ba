//! Agent context
//!
//! Every component an orchestrator needs, built once from a [`Config`] and
//! shared by reference. There is no global agent state.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{CodeBackend, GuiBackend, Unavailable};
use crate::config::{Config, ExecutionConfig};
use crate::dispatcher::ActionDispatcher;
use crate::error::{Error, Result};
use crate::memory::MemorySink;
use crate::providers::{ProviderManager, ProviderReport};
use crate::reflection::{HeuristicReflector, ReflectionEngine, ReflectionService};
use crate::registry::ToolRegistry;
use crate::task::{PlanningService, TaskGraphBuilder};

pub struct AgentContext {
    pub config: Config,
    pub registry: Arc<ToolRegistry>,
    pub providers: Arc<ProviderManager>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub planner: TaskGraphBuilder,
    pub reflection: ReflectionEngine,
    pub memory: Option<Arc<dyn MemorySink>>,
}

impl AgentContext {
    pub fn builder(config: Config) -> AgentContextBuilder {
        AgentContextBuilder::new(config)
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.config.execution
    }

    /// Start every enabled provider and install fallbacks for those that
    /// came up short
    pub async fn start_providers(&self) -> Vec<ProviderReport> {
        let reports = self.providers.start_enabled().await;
        let installed = self.dispatcher.install_fallbacks(&reports);
        if installed > 0 {
            tracing::info!(installed, "Installed fallback tools");
        }
        reports
    }

    pub async fn shutdown(&self) {
        for (name, result) in self.providers.stop_all().await {
            if let Err(e) = result {
                tracing::warn!(provider = %name, error = %e, "Failed to stop tool provider");
            }
        }
    }
}

pub struct AgentContextBuilder {
    config: Config,
    planner: Option<Arc<dyn PlanningService>>,
    reflector: Option<Arc<dyn ReflectionService>>,
    gui: Option<Arc<dyn GuiBackend>>,
    code: Option<Arc<dyn CodeBackend>>,
    memory: Option<Arc<dyn MemorySink>>,
    registry: Option<Arc<ToolRegistry>>,
}

impl AgentContextBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            planner: None,
            reflector: None,
            gui: None,
            code: None,
            memory: None,
            registry: None,
        }
    }

    pub fn planner(mut self, planner: Arc<dyn PlanningService>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Reflection service; the heuristic reflector when unset
    pub fn reflector(mut self, reflector: Arc<dyn ReflectionService>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn gui(mut self, gui: Arc<dyn GuiBackend>) -> Self {
        self.gui = Some(gui);
        self
    }

    /// Code backend; the process sandbox when unset
    pub fn code(mut self, code: Arc<dyn CodeBackend>) -> Self {
        self.code = Some(code);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<AgentContext> {
        let planner = self
            .planner
            .ok_or_else(|| Error::Config("no planning service configured".to_string()))?;
        let reflector = self
            .reflector
            .unwrap_or_else(|| Arc::new(HeuristicReflector));
        let config = self.config;
        let execution = &config.execution;

        let registry = self.registry.unwrap_or_default();
        for (alias, tool) in &config.tool_aliases {
            registry.add_alias(alias, tool.clone());
        }
        let providers = Arc::new(
            ProviderManager::with_configs(Arc::clone(&registry), config.providers.clone())
                .with_close_grace(execution.cancel_grace()),
        );

        let gui = self.gui.unwrap_or_else(|| Arc::new(Unavailable));
        let code = self.code.unwrap_or_else(|| default_code_backend(&config));
        let mut dispatcher = ActionDispatcher::new(Arc::clone(&registry), Arc::clone(&providers))
            .with_gui(gui)
            .with_code(code)
            .with_retry_delay(execution.retry_delay());
        if let Some(memory) = &self.memory {
            dispatcher = dispatcher.with_memory(Arc::clone(memory));
        }

        let planner = TaskGraphBuilder::new(planner)
            .with_registry(Arc::clone(&registry))
            .with_timeout(Duration::from_secs(config.planner.timeout_secs))
            .with_max_subtasks(config.planner.max_subtasks);
        let reflection = ReflectionEngine::new(reflector)
            .with_timeout(Duration::from_secs(config.reflection.timeout_secs));

        Ok(AgentContext {
            registry,
            providers,
            dispatcher: Arc::new(dispatcher),
            planner,
            reflection,
            memory: self.memory,
            config,
        })
    }
}

#[cfg(feature = "sandbox")]
fn default_code_backend(config: &Config) -> Arc<dyn CodeBackend> {
    Arc::new(crate::backend::SandboxCodeBackend::from_settings(&config.sandbox))
}

#[cfg(not(feature = "sandbox"))]
fn default_code_backend(_config: &Config) -> Arc<dyn CodeBackend> {
    Arc::new(Unavailable)
}
