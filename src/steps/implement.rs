use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use super::{bump, classify_output, findings, prompts, task, StepEnv, AGENT_EVENTS};
use crate::workflow::{EventKind, StepContext, StepHandler, StepOutput, WorkflowState};

/// Asks the implementer to carry out the task, plus any open findings.
pub struct ImplementStep {
    env: Arc<StepEnv>,
    agent: String,
}

impl ImplementStep {
    pub fn new(env: Arc<StepEnv>, agent: &str) -> Self {
        Self {
            env,
            agent: agent.to_string(),
        }
    }

    fn prompt(&self, state: &WorkflowState) -> anyhow::Result<String> {
        Ok(prompts::implement(task(state)?, &findings(state)))
    }
}

#[async_trait]
impl StepHandler for ImplementStep {
    fn emits(&self) -> &'static [EventKind] {
        AGENT_EVENTS
    }

    async fn execute(&self, ctx: &StepContext, state: &WorkflowState) -> anyhow::Result<StepOutput> {
        let prompt = self.prompt(state)?;
        let runs = bump(state, "implement_runs");
        info!(run_id = %ctx.run_id, agent = %self.agent, attempt = runs, "implementing");

        let result = self
            .env
            .run(&self.agent, &ctx.cancel, prompt)
            .await
            .with_context(|| format!("implementer '{}'", self.agent))?;

        Ok(StepOutput::new(classify_output(&self.agent, &result))
            .with("last_output", result.text)
            .with("implement_runs", runs))
    }

    fn describe(&self, state: &WorkflowState) -> String {
        match self.prompt(state) {
            Ok(prompt) => format!("{}: {}", self.agent, self.env.preview(&self.agent, prompt)),
            Err(e) => format!("{}: {e}", self.agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agent::testing::{output, ScriptedAgent};
    use crate::error::BatonError;
    use crate::steps::tests::{ctx, env, state_with_task};

    #[tokio::test]
    async fn records_output_and_attempts() {
        let coder = Arc::new(ScriptedAgent::new("coder", vec![output(0, "wrote login.rs")]));
        let step = ImplementStep::new(env(vec![coder.clone()]), "coder");
        let mut state = state_with_task("add login");
        state.set("implement_runs", 1);

        let out = step.execute(&ctx("implement"), &state).await.unwrap();
        assert_eq!(out.event.kind, EventKind::Success);
        assert_eq!(out.updates["last_output"], json!("wrote login.rs"));
        assert_eq!(out.updates["implement_runs"], json!(2));
        assert!(coder.calls()[0].contains("add login"));
    }

    #[tokio::test]
    async fn missing_task_is_an_error() {
        let coder = Arc::new(ScriptedAgent::new("coder", vec![]));
        let step = ImplementStep::new(env(vec![coder.clone()]), "coder");
        let err = step
            .execute(&ctx("implement"), &WorkflowState::new("implement"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no task"));
        assert!(coder.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_survives_context() {
        let coder = Arc::new(ScriptedAgent::failing_with("coder", BatonError::Cancelled));
        let step = ImplementStep::new(env(vec![coder]), "coder");
        let err = step
            .execute(&ctx("implement"), &state_with_task("t"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<BatonError>().is_some_and(BatonError::is_cancellation));
    }

    #[test]
    fn describe_shows_command() {
        let step = ImplementStep::new(env(vec![Arc::new(ScriptedAgent::new("coder", vec![]))]), "coder");
        let text = step.describe(&state_with_task("add login"));
        assert!(text.starts_with("coder: coder Implement"));
        assert!(step.describe(&WorkflowState::new("implement")).contains("no task"));
    }
}
