//! Stdio transport: provider processes and newline-delimited framing

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::McpError;

/// Longest single message accepted from a provider
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) type LineReader = FramedRead<BoxedReader, LinesCodec>;
pub(crate) type LineWriter = FramedWrite<BoxedWriter, LinesCodec>;

pub(crate) fn line_reader(reader: BoxedReader, max_length: usize) -> LineReader {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_length))
}

pub(crate) fn line_writer(writer: BoxedWriter) -> LineWriter {
    FramedWrite::new(writer, LinesCodec::new())
}

/// A provider launch command: program, arguments and extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ProviderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Split a shell-style command line (`npx -y "@scope/server" --root '/tmp/x y'`)
    pub fn parse(command_line: &str) -> Result<Self, McpError> {
        let mut parts = shlex::split(command_line)
            .ok_or_else(|| McpError::Spawn {
                command: command_line.to_string(),
                reason: "unbalanced quotes in command line".to_string(),
            })?
            .into_iter();

        let program = parts.next().ok_or_else(|| McpError::Spawn {
            command: command_line.to_string(),
            reason: "empty command line".to_string(),
        })?;

        Ok(Self {
            program,
            args: parts.collect(),
            env: HashMap::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

impl fmt::Display for ProviderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A spawned provider with its three standard streams captured
pub struct StdioProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Spawn the provider with piped stdio. The child is killed if dropped.
pub fn spawn(command: &ProviderCommand) -> Result<StdioProcess, McpError> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| McpError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McpError::Transport("Failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McpError::Transport("Failed to capture stdout".to_string()))?;
    let stderr = child.stderr.take();

    Ok(StdioProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Relay provider stderr into the log, one event per line
pub(crate) fn forward_stderr(provider: String, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => tracing::debug!(provider = %provider, "stderr: {}", line),
                Err(_) => break,
            }
        }
    })
}
