//! Executor entering the host's namespaces through PID 1

use super::{CommandExecutor, ExecParams, ExecResult};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

const NSENTER: &str = "nsenter";
const NS_ARGS: [&str; 8] = ["-t", "1", "-m", "-u", "-i", "-n", "-p", "--"];

/// Runs commands via `nsenter -t 1 -m -u -i -n -p -- <cmd>`
#[derive(Debug, Clone, Default)]
pub struct NsExecutor {
    /// Run commands directly in the agent's own namespaces
    direct: bool,
}

impl NsExecutor {
    pub fn new() -> Self {
        Self { direct: false }
    }

    /// Skip nsenter; used when the agent already runs on the host
    pub fn direct() -> Self {
        Self { direct: true }
    }

    fn command(&self, params: &ExecParams) -> Command {
        let mut command = if self.direct {
            let mut c = Command::new(&params.cmd);
            c.args(&params.args);
            c
        } else {
            let mut c = Command::new(NSENTER);
            c.args(NS_ARGS).arg(&params.cmd).args(&params.args);
            c
        };
        command.kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandExecutor for NsExecutor {
    async fn run(&self, params: ExecParams) -> Result<ExecResult> {
        debug!(command = %params.command_line(), "Executing host command");

        let mut command = self.command(&params);
        let output = command.output();
        let output = match params.timeout {
            Some(timeout) => tokio::time::timeout(timeout, output).await.map_err(|_| {
                Error::command(
                    params.command_line(),
                    format!("timed out after {}s", timeout.as_secs()),
                )
            })?,
            None => output.await,
        }
        .map_err(|e| Error::command(params.command_line(), e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn stream_lines(&self, params: ExecParams) -> Result<BoxStream<'static, Result<String>>> {
        debug!(command = %params.command_line(), "Starting host command stream");

        let mut child = self
            .command(&params)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::command(params.command_line(), e.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::command(params.command_line(), "stdout not captured".to_string())
        })?;

        let lines = BufReader::new(stdout).lines();
        // the child is moved into the stream so it lives as long as the reader
        let stream = stream::unfold((lines, child), |(mut lines, child)| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), (lines, child))),
                Ok(None) => None,
                Err(e) => Some((Err(Error::Io(e)), (lines, child))),
            }
        });
        Ok(stream.boxed())
    }
}
