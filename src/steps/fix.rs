use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{bump, classify_output, findings, prompts, task, StepEnv, AGENT_EVENTS};
use crate::workflow::{Event, EventKind, StepContext, StepHandler, StepOutput, WorkflowState};

/// Hands open findings to the fixer. Nothing to fix is a success.
pub struct FixStep {
    env: Arc<StepEnv>,
    agent: String,
}

impl FixStep {
    pub fn new(env: Arc<StepEnv>, agent: &str) -> Self {
        Self {
            env,
            agent: agent.to_string(),
        }
    }
}

#[async_trait]
impl StepHandler for FixStep {
    fn emits(&self) -> &'static [EventKind] {
        AGENT_EVENTS
    }

    async fn execute(&self, ctx: &StepContext, state: &WorkflowState) -> anyhow::Result<StepOutput> {
        let open = findings(state);
        if open.is_empty() {
            info!(run_id = %ctx.run_id, "no findings to fix");
            return Ok(StepOutput::new(Event::with_message(
                EventKind::Success,
                "no findings to fix",
            )));
        }

        let prompt = prompts::fix(task(state)?, &open);
        let runs = bump(state, "fix_runs");
        info!(run_id = %ctx.run_id, agent = %self.agent, findings = open.len(), "fixing");

        let result = self
            .env
            .run(&self.agent, &ctx.cancel, prompt)
            .await
            .with_context(|| format!("fixer '{}'", self.agent))?;

        let event = classify_output(&self.agent, &result);
        let mut output = StepOutput::new(event)
            .with("last_output", result.text)
            .with("fix_runs", runs);
        if output.event.kind == EventKind::Success {
            output = output.with("findings", Value::Null);
        }
        Ok(output)
    }

    fn describe(&self, state: &WorkflowState) -> String {
        let open = findings(state);
        if open.is_empty() {
            return format!("{}: fix review findings, skipped when there are none", self.agent);
        }
        match task(state) {
            Ok(task) => format!(
                "{}: {}",
                self.agent,
                self.env.preview(&self.agent, prompts::fix(task, &open))
            ),
            Err(e) => format!("{}: {e}", self.agent),
        }
    }
}
