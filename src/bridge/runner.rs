//! LLM subprocess invocation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to spawn LLM process: {0}")]
    Spawn(String),

    #[error("LLM process exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("LLM process exceeded {0:?}")]
    Timeout(Duration),
}

/// Whether a query opens a new upstream session or continues one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    New(String),
    Resume(String),
}

impl SessionMode {
    pub fn token(&self) -> &str {
        match self {
            SessionMode::New(t) | SessionMode::Resume(t) => t,
        }
    }
}

/// Everything needed for one subprocess run.
#[derive(Debug, Clone)]
pub struct QueryInvocation {
    pub prompt: String,
    pub session: Option<SessionMode>,
    pub max_turns: u32,
    pub model: Option<String>,
}

impl QueryInvocation {
    /// Command-line arguments for the CLI.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        match &self.session {
            Some(SessionMode::New(token)) => {
                args.push("--session-id".to_string());
                args.push(token.clone());
            }
            Some(SessionMode::Resume(token)) => {
                args.push("--resume".to_string());
                args.push(token.clone());
            }
            None => {}
        }
        args
    }
}

/// Runs one query and returns the raw stdout.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(&self, invocation: &QueryInvocation) -> Result<String, QueryError>;
}

/// Spawns the LLM CLI with a hard wall-clock limit.
pub struct CliRunner {
    command: String,
    timeout: Duration,
}

impl CliRunner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl QueryRunner for CliRunner {
    async fn run(&self, invocation: &QueryInvocation) -> Result<String, QueryError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            "Spawning {} ({:?})",
            self.command,
            invocation.session.as_ref().map(SessionMode::token)
        );

        let child = cmd
            .spawn()
            .map_err(|e| QueryError::Spawn(format!("{}: {}", self.command, e)))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| QueryError::Spawn(e.to_string()))?,
            Err(_) => return Err(QueryError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QueryError::Exit {
                code: output.status.code(),
                stderr: stderr.chars().take(500).collect(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
