//! Built-in execution backends for `gui` and `code` actions

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;
use crate::task::CodeMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuiRequest {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub language: String,
    pub source: String,
    pub mode: CodeMode,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// GUI automation collaborator
#[async_trait]
pub trait GuiBackend: Send + Sync {
    async fn execute(&self, request: GuiRequest) -> Result<Value, ExecutionError>;
}

/// Code execution collaborator
#[async_trait]
pub trait CodeBackend: Send + Sync {
    async fn run(&self, request: CodeRequest) -> Result<CodeOutput, ExecutionError>;
}

/// Stands in when no backend of a kind is configured; every call fails fatally
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

#[async_trait]
impl GuiBackend for Unavailable {
    async fn execute(&self, request: GuiRequest) -> Result<Value, ExecutionError> {
        Err(ExecutionError::fatal(format!(
            "no GUI backend configured for '{}'",
            request.operation
        )))
    }
}

#[async_trait]
impl CodeBackend for Unavailable {
    async fn run(&self, request: CodeRequest) -> Result<CodeOutput, ExecutionError> {
        Err(ExecutionError::fatal(format!(
            "no code backend configured for '{}'",
            request.language
        )))
    }
}

#[cfg(feature = "sandbox")]
pub use sandboxed::SandboxCodeBackend;

#[cfg(feature = "sandbox")]
mod sandboxed {
    use async_trait::async_trait;
    use taskpilot_sandbox::{
        CodeRunner, ExecutionMode, Language, SandboxConfig, SandboxError, SandboxResult,
    };

    use super::{CodeBackend, CodeOutput, CodeRequest};
    use crate::config::SandboxSettings;
    use crate::error::ExecutionError;
    use crate::task::CodeMode;

    /// Runs `code` actions in the process sandbox
    pub struct SandboxCodeBackend {
        runner: CodeRunner,
    }

    impl SandboxCodeBackend {
        pub fn new(config: SandboxConfig) -> Self {
            Self {
                runner: CodeRunner::new(config),
            }
        }

        /// Build from the `[sandbox]` config section; unknown language tags
        /// are skipped with a warning
        pub fn from_settings(settings: &SandboxSettings) -> Self {
            let mut config = SandboxConfig::default();
            if let Some(root) = &settings.root {
                config.root = root.clone();
            }
            config.limits.max_output_bytes = settings.max_output_bytes;
            config.allowed_languages = settings
                .allowed_languages
                .iter()
                .filter_map(|tag| match tag.parse::<Language>() {
                    Ok(language) => Some(language),
                    Err(e) => {
                        tracing::warn!(tag = %tag, error = %e, "Ignoring sandbox language");
                        None
                    }
                })
                .collect();
            Self::new(config)
        }
    }

    #[async_trait]
    impl CodeBackend for SandboxCodeBackend {
        async fn run(&self, request: CodeRequest) -> Result<CodeOutput, ExecutionError> {
            let sandbox_request = taskpilot_sandbox::CodeRequest {
                language: request.language,
                source: request.source,
                mode: match request.mode {
                    CodeMode::Script => ExecutionMode::Script,
                    CodeMode::Expression => ExecutionMode::Expression,
                },
                timeout_ms: Some(request.timeout_ms),
            };

            match self.runner.run(&sandbox_request).await {
                Ok(result) => outcome(result),
                Err(e @ (SandboxError::UnsupportedLanguage(_) | SandboxError::PolicyViolation(_))) => {
                    Err(ExecutionError::fatal(e.to_string()))
                }
                Err(e) => Err(ExecutionError::classified(e.to_string())),
            }
        }
    }

    fn outcome(result: SandboxResult) -> Result<CodeOutput, ExecutionError> {
        if result.killed {
            let reason = match result.kill_reason.as_deref() {
                Some(reason) if reason.eq_ignore_ascii_case("timeout") => "timed out",
                Some(reason) => reason,
                None => "terminated by signal",
            };
            return Err(ExecutionError::transient(format!(
                "code execution killed: {}",
                reason
            )));
        }
        Ok(CodeOutput {
            success: result.success(),
            exit_code: Some(result.exit_code),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }
}
