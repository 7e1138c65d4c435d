//! Scripted executor for unit tests

use super::{CommandExecutor, ExecParams, ExecResult};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

struct Rule {
    prefix: String,
    result: ExecResult,
    once: bool,
}

/// Returns canned results for command lines matching a prefix and records
/// every invocation. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    streams: Mutex<Vec<(String, Vec<String>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every matching command with `result`
    pub fn on(&self, prefix: &str, result: ExecResult) -> &Self {
        self.rules.lock().push(Rule {
            prefix: prefix.to_string(),
            result,
            once: false,
        });
        self
    }

    /// Answer the next matching command with `result`; takes priority over `on`
    pub fn on_once(&self, prefix: &str, result: ExecResult) -> &Self {
        self.rules.lock().insert(
            0,
            Rule {
                prefix: prefix.to_string(),
                result,
                once: true,
            },
        );
        self
    }

    /// Lines emitted by a streaming command
    pub fn on_stream(&self, prefix: &str, lines: &[&str]) -> &Self {
        self.streams.lock().push((
            prefix.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        ));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Invocations starting with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, params: ExecParams) -> Result<ExecResult> {
        let line = params.command_line();
        self.calls.lock().push(line.clone());

        let mut rules = self.rules.lock();
        let Some(index) = rules.iter().position(|r| line.starts_with(&r.prefix)) else {
            return Ok(ExecResult::ok(""));
        };
        if rules[index].once {
            Ok(rules.remove(index).result)
        } else {
            Ok(rules[index].result.clone())
        }
    }

    async fn stream_lines(&self, params: ExecParams) -> Result<BoxStream<'static, Result<String>>> {
        let line = params.command_line();
        self.calls.lock().push(line.clone());

        let lines = self
            .streams
            .lock()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix))
            .map(|(_, lines)| lines.clone())
            .unwrap_or_default();
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
