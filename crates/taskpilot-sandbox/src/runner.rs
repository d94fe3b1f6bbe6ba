//! Process-level execution of code requests

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::policy;
use crate::{CodeRequest, SandboxConfig, SandboxError, SandboxResult};

/// Runs code requests under one [`SandboxConfig`]
#[derive(Debug, Clone)]
pub struct CodeRunner {
    config: SandboxConfig,
}

impl CodeRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execute a request. A run that exceeds its timeout is killed and
    /// reported with `killed: true` rather than as an error.
    pub async fn run(&self, request: &CodeRequest) -> Result<SandboxResult, SandboxError> {
        let language = policy::admit(&self.config, request)?;
        let (program, args) = policy::command_line(language, request.mode, &request.source);

        tokio::fs::create_dir_all(&self.config.root).await?;

        let start = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .current_dir(&self.config.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Set environment restrictions
        cmd.env_clear();

        #[cfg(windows)]
        {
            cmd.env("PATH", r"C:\Windows\System32;C:\Windows;C:\Windows\System32\Wbem");
            cmd.env("USERPROFILE", self.config.root.display().to_string());
        }

        #[cfg(not(windows))]
        {
            cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
            cmd.env("HOME", self.config.root.display().to_string());
        }

        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.config.limits.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);

        tracing::debug!(%language, mode = ?request.mode, timeout_ms, "Running sandboxed code");

        let limit = self.config.limits.max_output_bytes;
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let (stdout, cut_out) = capped(&output.stdout, limit);
                let (stderr, cut_err) = capped(&output.stderr, limit);
                Ok(SandboxResult {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                    duration_ms: start.elapsed().as_millis() as u64,
                    killed: !output.status.success() && output.status.code().is_none(),
                    kill_reason: None,
                    truncated: cut_out || cut_err,
                })
            }
            Ok(Err(e)) => Err(SandboxError::Execution(format!("{}: {}", program, e))),
            Err(_) => {
                tracing::warn!(%language, timeout_ms, "Sandboxed code timed out and was killed");
                Ok(SandboxResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    killed: true,
                    kill_reason: Some("Timeout".to_string()),
                    truncated: false,
                })
            }
        }
    }
}

/// Lossy UTF-8 of at most `limit` bytes, cut on a character boundary
fn capped(bytes: &[u8], limit: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= limit {
        return (text.into_owned(), false);
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}
