//! Uniform surface over external coding-agent CLIs.
//!
//! Every tool gets one [`Agent`] implementation. Agents are opaque
//! subprocesses: the adapter builds an argument list, runs it, and interprets
//! the captured text (including rate-limit messages) heuristically.

mod claude;
mod codex;
mod patterns;
mod process;
mod registry;
mod runner;
#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ratelimit::RateLimitInfo;

pub use claude::ClaudeAgent;
pub use codex::CodexAgent;
pub use process::LARGE_PROMPT_BYTES;
pub use registry::{validate_agent_name, Registry};
pub use runner::AgentRunner;

/// Static settings for one agent, resolved from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentSettings {
    /// Executable name or path.
    pub command: String,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub allowed_tools: Vec<String>,
    /// Wait assumed when a rate limit carries no reset hint.
    pub default_reset: Option<Duration>,
}

impl AgentSettings {
    pub(crate) fn fallback_reset(&self) -> Duration {
        self.default_reset.unwrap_or(patterns::DEFAULT_RESET)
    }
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of live output from a running agent.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub agent: String,
    pub kind: StreamKind,
    pub line: String,
    /// Set when the line is a JSON document (stream-json style output).
    pub json: Option<serde_json::Value>,
}

pub type EventSink = UnboundedSender<StreamEvent>;

/// Request for a single agent invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub prompt: String,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Overrides the agent's configured model.
    pub model: Option<String>,
    pub effort: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub timeout: Option<Duration>,
    pub events: Option<EventSink>,
}

impl RunOpts {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }
}

/// Outcome of a subprocess that actually ran, successfully or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    /// The agent's final answer, extracted from stdout by the adapter.
    pub text: String,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr together, for heuristics that scan both.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Last non-empty lines of stderr (or stdout), for failure messages.
    pub fn tail(&self, lines: usize) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let kept: Vec<&str> = source
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        kept[kept.len().saturating_sub(lines)..].join("\n")
    }
}

/// The capability set every external agent tool provides.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable lowercase identifier, used as registry key and provider lookup.
    fn name(&self) -> &str;

    /// Run the tool to completion. Cancellation or deadline expiry kills the
    /// subprocess and returns `Cancelled` / `DeadlineExceeded`.
    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<RunResult>;

    /// Fail fast if the executable cannot be found.
    fn check_prerequisites(&self) -> Result<()>;

    /// Recognise a rate-limit message in captured output. Pure.
    fn parse_rate_limit(&self, output: &str) -> Option<RateLimitInfo>;

    /// The command line `run` would execute, for display only.
    fn dry_run_command(&self, opts: &RunOpts) -> String;
}

// Every adapter must provide the full capability set.
const _: fn() = || {
    fn assert_agent<T: Agent + 'static>() {}
    assert_agent::<ClaudeAgent>();
    assert_agent::<CodexAgent>();
};
