//! Host command execution
//!
//! Storage and replication tools run inside the host's namespaces so that
//! the agent sees the same devices and volume groups as the host.

mod nsenter;
#[cfg(test)]
pub mod testing;

pub use nsenter::NsExecutor;

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// One command invocation
#[derive(Debug, Clone, Default)]
pub struct ExecParams {
    pub cmd: String,
    pub args: Vec<String>,
    /// Kill the command once this elapses; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl ExecParams {
    pub fn new<I, S>(cmd: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `cmd arg1 arg2 ...`
    pub fn command_line(&self) -> String {
        std::iter::once(self.cmd.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured outcome of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`Error::Command`]
    pub fn check(self, params: &ExecParams) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::command(
                params.command_line(),
                format!("exit code {}: {}", self.exit_code, self.stderr.trim()),
            ))
        }
    }
}

/// Runs commands on the host
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run to completion; only spawn failures and timeouts are errors
    async fn run(&self, params: ExecParams) -> Result<ExecResult>;

    /// Start a long-running command and stream its stdout line by line
    async fn stream_lines(&self, params: ExecParams) -> Result<BoxStream<'static, Result<String>>>;

    /// Run and fail on a non-zero exit
    async fn run_checked(&self, params: ExecParams) -> Result<ExecResult> {
        let result = self.run(params.clone()).await?;
        result.check(&params)
    }
}
