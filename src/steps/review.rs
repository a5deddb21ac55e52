use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::prompts::{self, FINDING_MARKER};
use super::{task, StepEnv};
use crate::error::BatonError;
use crate::executor::run_bounded;
use crate::workflow::{Event, EventKind, StepContext, StepHandler, StepOutput, WorkflowState};

/// How one reviewer's run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Finished(String),
    Failed(String),
    RateLimited(String),
}

/// Runs every reviewer in parallel and merges their findings.
pub struct ReviewStep {
    env: Arc<StepEnv>,
    reviewers: Vec<String>,
}

impl ReviewStep {
    pub fn new(env: Arc<StepEnv>, reviewers: Vec<String>) -> Self {
        Self { env, reviewers }
    }
}

/// `FINDING:` lines from each report, in reviewer order, without
/// case-insensitive duplicates.
fn consolidate<'a>(reports: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut findings = Vec::new();
    for report in reports {
        for line in report.lines() {
            let Some(finding) = line.trim_start().strip_prefix(FINDING_MARKER) else {
                continue;
            };
            let finding = finding.trim();
            if !finding.is_empty() && seen.insert(finding.to_lowercase()) {
                findings.push(finding.to_string());
            }
        }
    }
    findings
}

#[async_trait]
impl StepHandler for ReviewStep {
    fn emits(&self) -> &'static [EventKind] {
        &[
            EventKind::Success,
            EventKind::Partial,
            EventKind::Failure,
            EventKind::RateLimited,
        ]
    }

    async fn execute(&self, ctx: &StepContext, state: &WorkflowState) -> anyhow::Result<StepOutput> {
        let prompt = prompts::review(task(state)?, state.get_str("last_output"));
        info!(run_id = %ctx.run_id, reviewers = self.reviewers.len(), "reviewing");

        let env = &self.env;
        let verdicts = run_bounded(
            &ctx.cancel,
            env.concurrency,
            self.reviewers.clone(),
            |task_ctx, reviewer| {
                let prompt = prompt.clone();
                async move {
                    let verdict = match env.run(&reviewer, &task_ctx.cancel, prompt).await {
                        Ok(result) if result.success() => Verdict::Finished(result.text),
                        Ok(result) => Verdict::Failed(format!(
                            "exit code {}: {}",
                            result.exit_code,
                            result.tail(3)
                        )),
                        Err(e) if e.is_cancellation() => return Err(e),
                        Err(e @ BatonError::MaxWaitsExceeded { .. }) => Verdict::RateLimited(e.to_string()),
                        Err(e) => Verdict::Failed(e.to_string()),
                    };
                    if let Verdict::Failed(reason) | Verdict::RateLimited(reason) = &verdict {
                        warn!(reviewer = %reviewer, reason = %reason, "reviewer did not finish");
                    }
                    Ok::<_, BatonError>(verdict)
                }
            },
        )
        .await?;

        let finished: Vec<&str> = verdicts
            .iter()
            .filter_map(|v| match v {
                Verdict::Finished(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        let findings = consolidate(finished.iter().copied());
        let total = verdicts.len();
        let summary = format!(
            "{} finding(s) from {}/{} reviewer(s)",
            findings.len(),
            finished.len(),
            total
        );

        let event = if finished.len() == total {
            Event::with_message(EventKind::Success, summary)
        } else if !finished.is_empty() {
            Event::with_message(EventKind::Partial, summary)
        } else if verdicts.iter().any(|v| matches!(v, Verdict::RateLimited(_))) {
            Event::with_message(EventKind::RateLimited, "every reviewer was rate limited")
        } else {
            Event::failure("no reviewer finished")
        };

        let passed = event.kind == EventKind::Success && findings.is_empty();
        Ok(StepOutput::new(event)
            .with(
                "findings",
                Value::Array(findings.into_iter().map(Value::String).collect()),
            )
            .with("review_passed", passed))
    }

    fn describe(&self, state: &WorkflowState) -> String {
        let prompt = match task(state) {
            Ok(task) => prompts::review(task, None),
            Err(e) => return format!("{}: {e}", self.reviewers.join(", ")),
        };
        let commands: Vec<String> = self
            .reviewers
            .iter()
            .map(|r| format!("{r}: {}", self.env.preview(r, prompt.clone())))
            .collect();
        format!(
            "{} reviewer(s), up to {} at once\n{}",
            self.reviewers.len(),
            self.env.concurrency.max(1),
            commands.join("\n")
        )
    }
}
