//! Configuration management for Taskpilot
//!
//! Handles loading and saving the TOML configuration: execution limits,
//! planner and reflection timeouts, tool providers and the code sandbox.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskpilot_mcp::{ProviderCommand, SessionOptions};

use crate::error::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General application settings
    #[serde(default)]
    pub general: GeneralConfig,
    /// Dispatch, retry and replanning limits
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    /// Tool providers by name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Other names planners may use for registered tools, alias -> tool
    #[serde(default)]
    pub tool_aliases: HashMap<String, String>,
    /// Code execution sandbox
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

impl Config {
    /// Get a specific provider config by name
    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// List all configured provider names, sorted
    pub fn list_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/// Execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-action timeout (seconds)
    pub action_timeout_secs: u64,
    /// Retries of a transient action failure inside one dispatch
    pub max_action_retries: u32,
    /// First delay between dispatch attempts; doubles up to 8x
    pub retry_delay_ms: u64,
    /// Failed runs of one subtask before reflection is consulted
    pub subtask_retry_budget: u32,
    /// Subtask re-runs allowed across the whole task
    pub global_retry_budget: u32,
    /// Replanning rounds before the task fails
    pub max_replans: u32,
    /// Subtasks executing at once
    pub concurrency: usize,
    /// How long cancellation waits for in-flight work (milliseconds)
    pub cancel_grace_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            action_timeout_secs: 30,
            max_action_retries: 2,
            retry_delay_ms: 250,
            subtask_retry_budget: 3,
            global_retry_budget: 10,
            max_replans: 2,
            concurrency: 4,
            cancel_grace_ms: 2000,
        }
    }
}

impl ExecutionConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub timeout_secs: u64,
    /// Largest plan accepted from the planning service
    pub max_subtasks: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_subtasks: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub timeout_secs: u64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Built-in backend that can stand in for a provider's tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackBackend {
    Gui,
    Code,
}

/// Tool provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Start this provider with `start_enabled`
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Launch command line, split shell-style
    pub command: String,
    /// Extra environment for the provider process
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Tools that must be present after discovery
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tools: Vec<String>,
    /// Backend that serves `required_tools` when the provider cannot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackBackend>,
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_connect_retries() -> u32 {
    1
}

impl ProviderConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            enabled: true,
            command: command.into(),
            env: HashMap::new(),
            handshake_timeout_secs: default_handshake_timeout(),
            connect_retries: default_connect_retries(),
            required_tools: Vec::new(),
            fallback: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackBackend) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_required_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed launch command with the configured environment
    pub fn launch_command(&self) -> Result<ProviderCommand> {
        ProviderCommand::parse(&self.command)
            .map(|command| command.with_env(self.env.clone()))
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn session_options(&self, close_grace: Duration) -> SessionOptions {
        SessionOptions {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_retries: self.connect_retries,
            close_grace,
            ..Default::default()
        }
    }
}

/// Code sandbox settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Working root; a directory under the system temp dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    pub max_output_bytes: usize,
    pub allowed_languages: Vec<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            root: None,
            max_output_bytes: 1024 * 1024,
            allowed_languages: vec![
                "python".to_string(),
                "sh".to_string(),
                "bash".to_string(),
                "node".to_string(),
            ],
        }
    }
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("taskpilot").join("config.toml"))
    }

    /// Load configuration from a file
    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Add or replace a provider
    pub fn set_provider(&mut self, name: &str, provider: ProviderConfig) {
        self.config.providers.insert(name.to_string(), provider);
    }

    /// List all configured providers
    pub fn list_providers(&self) -> Vec<&str> {
        self.config.list_providers()
    }
}
