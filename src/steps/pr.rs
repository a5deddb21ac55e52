use std::sync::{Arc, LazyLock};

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use super::{classify_output, prompts, task, StepEnv, AGENT_EVENTS};
use crate::workflow::{Event, EventKind, StepContext, StepHandler, StepOutput, WorkflowState};

static PR_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/[\w.-]+/[\w.-]+/pull/\d+").expect("valid regex")
});

/// First GitHub pull request URL in `text`.
pub fn extract_pr_url(text: &str) -> Option<&str> {
    PR_URL.find(text).map(|m| m.as_str())
}

/// Asks the PR agent to commit, push and open a pull request.
pub struct PrStep {
    env: Arc<StepEnv>,
    agent: String,
}

impl PrStep {
    pub fn new(env: Arc<StepEnv>, agent: &str) -> Self {
        Self {
            env,
            agent: agent.to_string(),
        }
    }
}

#[async_trait]
impl StepHandler for PrStep {
    fn emits(&self) -> &'static [EventKind] {
        AGENT_EVENTS
    }

    async fn execute(&self, ctx: &StepContext, state: &WorkflowState) -> anyhow::Result<StepOutput> {
        let prompt = prompts::pr(task(state)?, state.get_str("branch"));
        info!(run_id = %ctx.run_id, agent = %self.agent, branch = ?state.get_str("branch"), "opening pull request");

        let result = self
            .env
            .run(&self.agent, &ctx.cancel, prompt)
            .await
            .with_context(|| format!("pr agent '{}'", self.agent))?;

        let event = classify_output(&self.agent, &result);
        if event.kind != EventKind::Success {
            return Ok(StepOutput::new(event).with("last_output", result.text));
        }

        let url = extract_pr_url(&result.text)
            .or_else(|| extract_pr_url(&result.stdout))
            .map(str::to_string);
        Ok(match url {
            Some(url) => {
                info!(run_id = %ctx.run_id, url = %url, "pull request opened");
                StepOutput::new(Event::with_message(EventKind::Success, url.clone()))
                    .with("pr_url", url)
            }
            None => StepOutput::new(Event::failure("no pull request URL in agent output")),
        }
        .with("last_output", result.text))
    }

    fn describe(&self, state: &WorkflowState) -> String {
        match task(state) {
            Ok(task) => format!(
                "{}: {}",
                self.agent,
                self.env
                    .preview(&self.agent, prompts::pr(task, state.get_str("branch")))
            ),
            Err(e) => format!("{}: {e}", self.agent),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agent::testing::{output, ScriptedAgent};
    use crate::steps::tests::{ctx, env, state_with_task};

    #[test]
    fn finds_first_pull_url() {
        assert_eq!(
            extract_pr_url("Created https://github.com/acme/web-app/pull/42 and https://github.com/a/b/pull/1"),
            Some("https://github.com/acme/web-app/pull/42")
        );
        assert_eq!(extract_pr_url("https://github.com/acme/web-app/issues/42"), None);
    }

    #[tokio::test]
    async fn records_pr_url() {
        let agent = Arc::new(ScriptedAgent::new(
            "shipper",
            vec![output(0, "Done.\nhttps://github.com/acme/app/pull/9\n")],
        ));
        let step = PrStep::new(env(vec![agent.clone()]), "shipper");
        let mut state = state_with_task("t");
        state.set("branch", "feat/login");

        let out = step.execute(&ctx("pr"), &state).await.unwrap();
        assert_eq!(out.event.kind, EventKind::Success);
        assert_eq!(out.updates["pr_url"], json!("https://github.com/acme/app/pull/9"));
        assert!(agent.calls()[0].contains("`feat/login`"));
    }

    #[tokio::test]
    async fn missing_url_is_failure() {
        let agent = Arc::new(ScriptedAgent::new("shipper", vec![output(0, "pushed")]));
        let step = PrStep::new(env(vec![agent]), "shipper");
        let out = step.execute(&ctx("pr"), &state_with_task("t")).await.unwrap();
        assert_eq!(out.event.kind, EventKind::Failure);
        assert!(!out.updates.contains_key("pr_url"));
    }

    #[tokio::test]
    async fn needs_human_passes_through() {
        let agent = Arc::new(ScriptedAgent::new(
            "shipper",
            vec![output(0, "NEEDS_HUMAN: no push access to origin")],
        ));
        let step = PrStep::new(env(vec![agent]), "shipper");
        let out = step.execute(&ctx("pr"), &state_with_task("t")).await.unwrap();
        assert_eq!(out.event.kind, EventKind::NeedsHuman);
    }
}
