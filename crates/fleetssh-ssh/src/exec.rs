//! Command results and asynchronous command handles

use crate::TransportError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Outcome of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Command line that was run
    pub command: String,
    /// Remote exit code
    pub exit_code: i32,
    /// Captured standard output, one entry per line
    pub stdout: Vec<String>,
    /// Captured standard error, one entry per line
    pub stderr: Vec<String>,
}

impl ExecResult {
    /// Build a result from raw captured streams
    pub fn from_output(command: impl Into<String>, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stdout: split_lines(stdout),
            stderr: split_lines(stderr),
        }
    }

    /// Standard output joined and trimmed
    pub fn stdout_str(&self) -> String {
        self.stdout.join("\n").trim().to_string()
    }

    /// Standard error joined and trimmed
    pub fn stderr_str(&self) -> String {
        self.stderr.join("\n").trim().to_string()
    }

    /// Decode standard output as JSON
    pub fn stdout_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.stdout_str())
    }

    /// Whether the command exited with status zero
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// A line of streamed command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// Line written to standard output
    Stdout(String),
    /// Line written to standard error
    Stderr(String),
}

/// Producer half of a [`CommandHandle`], driven by the transport
#[derive(Debug)]
pub struct CommandSink {
    lines: mpsc::UnboundedSender<OutputLine>,
    result: oneshot::Sender<Result<ExecResult, TransportError>>,
}

impl CommandSink {
    /// Forward one line of output; dropped silently if nobody listens
    pub fn line(&self, line: OutputLine) {
        let _ = self.lines.send(line);
    }

    /// Publish the final result
    pub fn finish(self, result: Result<ExecResult, TransportError>) {
        let _ = self.result.send(result);
    }
}

/// Handle to a command started with `execute_async`
#[derive(Debug)]
pub struct CommandHandle {
    command: String,
    lines: mpsc::UnboundedReceiver<OutputLine>,
    result: oneshot::Receiver<Result<ExecResult, TransportError>>,
}

impl CommandHandle {
    /// Create a connected sink/handle pair for `command`
    pub fn channel(command: impl Into<String>) -> (CommandSink, CommandHandle) {
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();

        let sink = CommandSink {
            lines: lines_tx,
            result: result_tx,
        };
        let handle = CommandHandle {
            command: command.into(),
            lines: lines_rx,
            result: result_rx,
        };
        (sink, handle)
    }

    /// A handle for a command that has already finished
    pub fn finished(result: ExecResult) -> Self {
        let (sink, handle) = Self::channel(result.command.clone());
        for line in &result.stdout {
            sink.line(OutputLine::Stdout(line.clone()));
        }
        for line in &result.stderr {
            sink.line(OutputLine::Stderr(line.clone()));
        }
        sink.finish(Ok(result));
        handle
    }

    /// Command line this handle tracks
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next line of output, or `None` once the command has stopped writing
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Wait for the command to finish
    pub async fn wait(self) -> Result<ExecResult, TransportError> {
        self.result.await.map_err(|_| {
            TransportError::Session(format!(
                "command '{}' ended without reporting a result",
                self.command
            ))
        })?
    }
}
