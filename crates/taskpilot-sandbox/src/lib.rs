//! Taskpilot Sandbox - restricted execution of generated code
//!
//! Runs a `{language, source, mode, timeout}` request as a child process
//! with a cleared environment, a fixed `PATH`, a private working root, a
//! wall-clock timeout and a cap on captured output.

pub mod policy;
pub mod runner;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use runner::CodeRunner;

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Working directory (and `HOME`) for every run
    pub root: PathBuf,
    /// Languages that may be executed
    pub allowed_languages: BTreeSet<Language>,
    /// Resource limits
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("taskpilot-sandbox"),
            allowed_languages: [Language::Python, Language::Shell, Language::Bash, Language::Node]
                .into_iter()
                .collect(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Resource limits for sandboxed processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Timeout used when the request does not carry one
    pub default_timeout_ms: u64,
    /// Bytes kept from each of stdout and stderr
    pub max_output_bytes: usize,
    /// Longest accepted source text
    pub max_source_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_output_bytes: 1024 * 1024, // 1 MB
            max_source_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    #[serde(alias = "sh")]
    Shell,
    Bash,
    #[serde(alias = "javascript")]
    Node,
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "sh" | "shell" => Ok(Self::Shell),
            "bash" => Ok(Self::Bash),
            "node" | "javascript" | "js" => Ok(Self::Node),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Python => "python",
            Self::Shell => "shell",
            Self::Bash => "bash",
            Self::Node => "node",
        };
        write!(f, "{}", s)
    }
}

/// How the source text is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Run the source as a program
    #[default]
    Script,
    /// Evaluate the source as an expression and print its value
    Expression,
}

impl FromStr for ExecutionMode {
    type Err = SandboxError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "" | "script" | "exec" => Ok(Self::Script),
            "expression" | "eval" => Ok(Self::Expression),
            other => Err(SandboxError::PolicyViolation(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// One code execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Sandbox execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub killed: bool,
    pub kill_reason: Option<String>,
    /// Output was cut at `max_output_bytes`
    pub truncated: bool,
}

impl SandboxResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.killed
    }
}

/// Sandbox errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Policy violation: {0}")]
    PolicyViolation(String),
    #[error("Execution failed: {0}")]
    Execution(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
