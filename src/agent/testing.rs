//! Scripted agents for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Agent, RunOpts, RunResult};
use crate::error::{BatonError, Result};
use crate::ratelimit::RateLimitInfo;

/// Replays queued results in order (then succeeds with "ok") and records
/// every prompt it was given. Output containing `429` is a rate limit with a
/// 20ms reset.
pub(crate) struct ScriptedAgent {
    name: String,
    results: Mutex<VecDeque<Result<RunResult>>>,
    prompts: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedAgent {
    pub(crate) fn new(name: &str, results: Vec<RunResult>) -> Self {
        Self {
            name: name.into(),
            results: Mutex::new(results.into_iter().map(Ok).collect()),
            prompts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn failing_with(name: &str, err: BatonError) -> Self {
        let agent = Self::new(name, vec![]);
        agent.results.lock().unwrap().push_back(Err(err));
        agent
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

pub(crate) fn output(exit_code: i32, text: &str) -> RunResult {
    RunResult {
        exit_code,
        duration: Duration::from_millis(1),
        stdout: text.into(),
        stderr: String::new(),
        text: text.into(),
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken, opts: &RunOpts) -> Result<RunResult> {
        if cancel.is_cancelled() {
            return Err(BatonError::Cancelled);
        }
        self.prompts.lock().unwrap().push(opts.prompt.clone());
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BatonError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(output(0, "ok")))
    }

    fn check_prerequisites(&self) -> Result<()> {
        Ok(())
    }

    fn parse_rate_limit(&self, output: &str) -> Option<RateLimitInfo> {
        output.contains("429").then(|| RateLimitInfo {
            provider: self.name.clone(),
            reset_after: Duration::from_millis(20),
            message: "429".into(),
        })
    }

    fn dry_run_command(&self, opts: &RunOpts) -> String {
        format!("{} {}", self.name, opts.prompt)
    }
}
