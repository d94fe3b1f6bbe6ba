//! Tool provider manager
//!
//! Owns one [`Session`] per configured provider, keeps the tool registry in
//! step with each session's lifecycle, and reports which providers came up
//! short so the dispatcher can install fallbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskpilot_mcp::{McpError, ProviderCommand, Session, SessionState, ToolCallResult};
use tokio::task::JoinHandle;

use crate::config::{FallbackBackend, ProviderConfig};
use crate::error::{Error, Result};
use crate::registry::{BackendRef, ToolDescriptor, ToolRegistry};

/// Status of a tool provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    /// Provider is not running
    Stopped,
    /// Provider is being spawned or is handshaking
    Starting,
    /// Provider is connected and its tools are registered
    Running,
    /// Provider failed to start or exited unexpectedly
    Failed(String),
}

/// Outcome of starting one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReport {
    pub name: String,
    pub status: ProviderStatus,
    /// Tools registered from this provider
    pub tools: Vec<String>,
    /// Configured required tools
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Required tools absent after discovery
    #[serde(default)]
    pub missing_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackBackend>,
}

impl ProviderReport {
    fn failed(name: &str, config: Option<&ProviderConfig>, error: &Error) -> Self {
        Self {
            name: name.to_string(),
            status: ProviderStatus::Failed(error.to_string()),
            tools: Vec::new(),
            required_tools: config.map(|c| c.required_tools.clone()).unwrap_or_default(),
            missing_tools: config.map(|c| c.required_tools.clone()).unwrap_or_default(),
            error: Some(error.to_string()),
            fallback: config.and_then(|c| c.fallback),
        }
    }

    /// Whether some required capability is not served by the provider
    pub fn is_degraded(&self) -> bool {
        self.error.is_some() || !self.missing_tools.is_empty()
    }
}

struct ProviderEntry {
    config: Option<ProviderConfig>,
    status: ProviderStatus,
    session: Option<Arc<Session>>,
    watcher: Option<JoinHandle<()>>,
}

impl ProviderEntry {
    fn new(config: Option<ProviderConfig>) -> Self {
        Self {
            config,
            status: ProviderStatus::Stopped,
            session: None,
            watcher: None,
        }
    }
}

type Entries = Arc<Mutex<HashMap<String, ProviderEntry>>>;

/// Manager for tool provider sessions
pub struct ProviderManager {
    registry: Arc<ToolRegistry>,
    close_grace: Duration,
    entries: Entries,
    /// Connection establishment is serialized per launch command
    connect_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProviderManager {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            close_grace: Duration::from_secs(2),
            entries: Arc::new(Mutex::new(HashMap::new())),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize the manager with provider configurations
    pub fn with_configs(registry: Arc<ToolRegistry>, configs: HashMap<String, ProviderConfig>) -> Self {
        let manager = Self::new(registry);
        for (name, config) in configs {
            manager.add_provider(name, config);
        }
        manager
    }

    /// Grace period given to in-flight calls by `stop`
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Add or replace a provider configuration; a running provider keeps
    /// its session until restarted
    pub fn add_provider(&self, name: impl Into<String>, config: ProviderConfig) {
        let name = name.into();
        let mut entries = self.entries.lock();
        match entries.get_mut(&name) {
            Some(entry) => entry.config = Some(config),
            None => {
                entries.insert(name, ProviderEntry::new(Some(config)));
            }
        }
    }

    pub fn config(&self, name: &str) -> Option<ProviderConfig> {
        self.entries.lock().get(name).and_then(|e| e.config.clone())
    }

    pub fn status(&self, name: &str) -> Option<ProviderStatus> {
        self.entries.lock().get(name).map(|e| e.status.clone())
    }

    /// Status of every known provider, sorted by name
    pub fn statuses(&self) -> Vec<(String, ProviderStatus)> {
        let mut statuses: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status.clone()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.entries.lock().get(name).and_then(|e| e.session.clone())
    }

    /// Spawn a configured provider, discover its tools and register them
    pub async fn start(&self, name: &str) -> Result<ProviderReport> {
        let config = self
            .config(name)
            .ok_or_else(|| Error::Provider(format!("provider '{}' is not configured", name)))?;
        let command = config.launch_command()?;

        let lock = self.connect_lock(&config.command);
        let _guard = lock.lock().await;

        if let Some(session) = self.session(name)
            && session.state() == SessionState::Ready
        {
            return Ok(self.report(name, &config));
        }
        if let Some(other) = self.serving(&config.command, name) {
            return Err(Error::Provider(format!(
                "provider '{}' uses the same command as running provider '{}'",
                name, other
            )));
        }

        self.set_status(name, ProviderStatus::Starting);
        tracing::info!(provider = %name, command = %command, "Starting tool provider");

        let session = Arc::new(Session::new(name, config.session_options(self.close_grace)));
        match self.bring_up(name, &session, &command).await {
            Ok(report) => Ok(report),
            Err(e) => {
                // Nothing partial survives a failed start
                let _ = session.close_with_grace(Duration::ZERO).await;
                tracing::warn!(provider = %name, error = %e, "Tool provider failed to start");
                self.set_status(name, ProviderStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        name: &str,
        session: &Arc<Session>,
        command: &ProviderCommand,
    ) -> Result<ProviderReport> {
        session.connect(command).await?;
        self.attach(name, Arc::clone(session)).await
    }

    /// Take over a session that is already connected, e.g. one served over
    /// an in-process stream
    pub async fn adopt(&self, name: &str, session: Arc<Session>) -> Result<ProviderReport> {
        if session.state() != SessionState::Ready {
            return Err(McpError::NotReady(session.state()).into());
        }
        self.entries
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| ProviderEntry::new(None));
        self.attach(name, session).await
    }

    async fn attach(&self, name: &str, session: Arc<Session>) -> Result<ProviderReport> {
        let tools = session.list_tools().await?;

        let backend = BackendRef::Provider(name.to_string());
        let config = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(name.to_string())
                .or_insert_with(|| ProviderEntry::new(None));
            if let Some(old) = entry.watcher.take() {
                old.abort();
            }
            entry.session = Some(Arc::clone(&session));
            entry.status = ProviderStatus::Running;

            // Drop what an earlier session of this provider left behind
            self.registry.unregister(&backend);
            for tool in tools {
                self.registry.register(ToolDescriptor::from_mcp(tool, name));
            }
            entry.config.clone()
        };

        let watcher = self.watch(name.to_string(), Arc::clone(&session));
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.watcher = Some(watcher);
        }

        let report = match &config {
            Some(config) => self.report(name, config),
            None => ProviderReport {
                name: name.to_string(),
                status: ProviderStatus::Running,
                tools: self.registry.names_for(&backend),
                required_tools: Vec::new(),
                missing_tools: Vec::new(),
                error: None,
                fallback: None,
            },
        };
        if !report.missing_tools.is_empty() {
            tracing::warn!(
                provider = %name,
                missing = ?report.missing_tools,
                "Tool provider lacks required tools"
            );
        }
        tracing::info!(provider = %name, tools = report.tools.len(), "Tool provider ready");
        Ok(report)
    }

    /// Unregister the provider's tools once its session disconnects, for
    /// whatever reason
    fn watch(&self, name: String, session: Arc<Session>) -> JoinHandle<()> {
        let mut states = session.subscribe();
        let registry = Arc::clone(&self.registry);
        let entries = Arc::clone(&self.entries);

        tokio::spawn(async move {
            let _ = states
                .wait_for(|state| *state == SessionState::Disconnected)
                .await;
            drop(states);

            {
                let mut entries = entries.lock();
                if let Some(entry) = entries.get_mut(&name) {
                    let current = entry
                        .session
                        .as_ref()
                        .is_none_or(|s| Arc::ptr_eq(s, &session));
                    if current {
                        registry.unregister(&BackendRef::Provider(name.clone()));
                        if entry.session.take().is_some() {
                            tracing::warn!(provider = %name, "Tool provider disconnected");
                            entry.status = ProviderStatus::Failed("provider exited".to_string());
                        }
                    }
                }
            }

            // Reap the process
            let _ = session.close_with_grace(Duration::ZERO).await;
        })
    }

    /// Start every enabled provider, reporting each outcome
    pub async fn start_enabled(&self) -> Vec<ProviderReport> {
        let mut enabled: Vec<(String, ProviderConfig)> = self
            .entries
            .lock()
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .config
                    .as_ref()
                    .filter(|c| c.enabled)
                    .map(|c| (name.clone(), c.clone()))
            })
            .collect();
        enabled.sort_by(|a, b| a.0.cmp(&b.0));

        let starts = enabled.iter().map(|(name, config)| async move {
            match self.start(name).await {
                Ok(report) => report,
                Err(e) => ProviderReport::failed(name, Some(config), &e),
            }
        });
        futures::future::join_all(starts).await
    }

    /// Stop a provider, giving in-flight calls the configured grace period
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.stop_with_grace(name, self.close_grace).await
    }

    async fn stop_with_grace(&self, name: &str, grace: Duration) -> Result<()> {
        let (session, watcher) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| Error::Provider(format!("provider '{}' not found", name)))?;
            entry.status = ProviderStatus::Stopped;
            (entry.session.take(), entry.watcher.take())
        };

        if let Some(session) = session {
            tracing::info!(provider = %name, "Stopping tool provider");
            session.close_with_grace(grace).await?;
        }
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
        // The watcher may have been aborted before it ran
        self.registry.unregister(&BackendRef::Provider(name.to_string()));
        Ok(())
    }

    /// Stop every provider
    pub async fn stop_all(&self) -> Vec<(String, Result<()>)> {
        self.stop_each(self.close_grace).await
    }

    /// Force-close one provider's session without a grace period, failing
    /// its in-flight calls with a cancellation error, then bring it back up.
    /// Providers without a launch configuration stay stopped.
    pub async fn reset(&self, name: &str) -> Result<Option<ProviderReport>> {
        tracing::warn!(provider = %name, "Force-closing tool provider");
        self.stop_with_grace(name, Duration::ZERO).await?;
        if self.config(name).is_none() {
            return Ok(None);
        }
        self.start(name).await.map(Some)
    }

    async fn stop_each(&self, grace: Duration) -> Vec<(String, Result<()>)> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.stop_with_grace(&name, grace).await;
            results.push((name, result));
        }
        results
    }

    /// Call a tool on a running provider
    pub async fn call(
        &self,
        provider: &str,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> std::result::Result<ToolCallResult, McpError> {
        let session = self
            .session(provider)
            .ok_or(McpError::NotReady(SessionState::Disconnected))?;
        session.call_tool(tool, arguments, timeout).await
    }

    fn report(&self, name: &str, config: &ProviderConfig) -> ProviderReport {
        let tools = self.registry.names_for(&BackendRef::Provider(name.to_string()));
        let missing_tools = config
            .required_tools
            .iter()
            .filter(|t| !tools.contains(t))
            .cloned()
            .collect();
        ProviderReport {
            name: name.to_string(),
            status: self.status(name).unwrap_or(ProviderStatus::Stopped),
            tools,
            required_tools: config.required_tools.clone(),
            missing_tools,
            error: None,
            fallback: config.fallback,
        }
    }

    fn set_status(&self, name: &str, status: ProviderStatus) {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.status = status;
        }
    }

    fn connect_lock(&self, command: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.connect_locks.lock().entry(command.to_string()).or_default())
    }

    /// Another provider with a live session for the same command
    fn serving(&self, command: &str, name: &str) -> Option<String> {
        self.entries.lock().iter().find_map(|(other, entry)| {
            let same = other != name
                && entry.session.is_some()
                && entry.config.as_ref().is_some_and(|c| c.command == command);
            same.then(|| other.clone())
        })
    }
}

impl Drop for ProviderManager {
    fn drop(&mut self) {
        for entry in self.entries.lock().values_mut() {
            if let Some(watcher) = entry.watcher.take() {
                watcher.abort();
            }
        }
    }
}
