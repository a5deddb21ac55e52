//! The implement → review → fix → pr workflow.

mod fix;
mod implement;
mod pr;
mod prompts;
mod review;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunner, EventSink, Registry, RunOpts, RunResult};
use crate::error::{BatonError, Result};
use crate::workflow::{
    Event, EventKind, Steps, TransitionRule, TransitionTable, WorkflowDefinition, WorkflowState,
    FAILURE_TERMINAL, SUCCESS_TERMINAL,
};

pub use fix::FixStep;
pub use implement::ImplementStep;
pub use pr::PrStep;
pub use review::ReviewStep;

pub const WORKFLOW_NAME: &str = "default";
pub const IMPLEMENT: &str = "implement";
pub const REVIEW: &str = "review";
pub const FIX: &str = "fix";
pub const PR: &str = "pr";

/// Marker line an agent prints when it cannot proceed.
pub const BLOCKED_MARKER: &str = "BLOCKED:";
/// Marker line an agent prints when a person has to decide.
pub const NEEDS_HUMAN_MARKER: &str = "NEEDS_HUMAN:";

/// Events every agent-backed step can end with.
const AGENT_EVENTS: &[EventKind] = &[
    EventKind::Success,
    EventKind::Failure,
    EventKind::Blocked,
    EventKind::NeedsHuman,
    EventKind::RateLimited,
];

/// Which agent plays which part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roles {
    pub implementer: String,
    pub reviewers: Vec<String>,
    pub fixer: String,
    pub pr_agent: String,
}

impl Roles {
    fn all(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.implementer)
            .chain(&self.reviewers)
            .chain([&self.fixer, &self.pr_agent])
    }
}

/// Everything a step needs to launch agents.
pub struct StepEnv {
    pub registry: Registry,
    pub runner: AgentRunner,
    pub workdir: Option<PathBuf>,
    /// Per-agent deadline.
    pub timeouts: HashMap<String, Duration>,
    pub events: Option<EventSink>,
    /// Ceiling for parallel reviewers.
    pub concurrency: usize,
}

impl StepEnv {
    pub fn new(registry: Registry, runner: AgentRunner) -> Self {
        Self {
            registry,
            runner,
            workdir: None,
            timeouts: HashMap::new(),
            events: None,
            concurrency: 1,
        }
    }

    fn opts(&self, agent: &str, prompt: String) -> RunOpts {
        RunOpts {
            prompt,
            workdir: self.workdir.clone(),
            timeout: self.timeouts.get(agent).copied(),
            events: self.events.clone(),
            ..Default::default()
        }
    }

    /// Run `agent` through the rate-limit protocol.
    pub async fn run(&self, agent: &str, cancel: &CancellationToken, prompt: String) -> Result<RunResult> {
        let handle = self.registry.get(agent)?;
        let opts = self.opts(agent, prompt);
        self.runner.run(handle.as_ref(), cancel, &opts).await
    }

    /// The command `run` would execute, for dry runs.
    pub fn preview(&self, agent: &str, prompt: String) -> String {
        match self.registry.get(agent) {
            Ok(handle) => handle.dry_run_command(&self.opts(agent, prompt)),
            Err(e) => format!("<{e}>"),
        }
    }
}

/// The built-in transition table.
pub fn default_transitions() -> TransitionTable {
    use EventKind::*;

    TransitionTable::new()
        .on(IMPLEMENT, Success, REVIEW)
        .on_any(IMPLEMENT, &[Failure, Blocked, NeedsHuman, RateLimited], FAILURE_TERMINAL)
        .on_any(REVIEW, &[Success, Partial], FIX)
        .on_any(REVIEW, &[Failure, RateLimited], FAILURE_TERMINAL)
        .on(FIX, Success, PR)
        .on(FIX, Failure, IMPLEMENT)
        .on_any(FIX, &[Blocked, NeedsHuman, RateLimited], FAILURE_TERMINAL)
        .on(PR, Success, SUCCESS_TERMINAL)
        .on_any(PR, &[Failure, Blocked, NeedsHuman, RateLimited], FAILURE_TERMINAL)
}

/// The `default` workflow, with `overrides` replacing or adding rows.
pub fn default_workflow(overrides: &[TransitionRule]) -> WorkflowDefinition {
    let mut transitions = default_transitions();
    for rule in overrides {
        transitions.add(rule.from.clone(), rule.on, rule.to.clone());
    }
    WorkflowDefinition::new(WORKFLOW_NAME, IMPLEMENT, transitions)
}

/// Register the four steps. Every agent named in `roles` must exist.
pub fn build_steps(env: Arc<StepEnv>, roles: &Roles) -> Result<Steps> {
    for name in roles.all() {
        env.registry.get(name)?;
    }
    if roles.reviewers.is_empty() {
        return Err(BatonError::Config("at least one reviewer is required".into()));
    }

    Steps::new()
        .with(IMPLEMENT, Arc::new(ImplementStep::new(env.clone(), &roles.implementer)))?
        .with(REVIEW, Arc::new(ReviewStep::new(env.clone(), roles.reviewers.clone())))?
        .with(FIX, Arc::new(FixStep::new(env.clone(), &roles.fixer)))?
        .with(PR, Arc::new(PrStep::new(env, &roles.pr_agent)))
}

/// Turn a finished agent run into an event. Marker lines win over the exit
/// code; otherwise a non-zero exit is a failure.
pub fn classify_output(agent: &str, result: &RunResult) -> Event {
    for line in result.text.lines().chain(result.stdout.lines()) {
        let line = line.trim_start();
        if let Some(reason) = line.strip_prefix(BLOCKED_MARKER) {
            return Event::with_message(EventKind::Blocked, reason.trim());
        }
        if let Some(reason) = line.strip_prefix(NEEDS_HUMAN_MARKER) {
            return Event::with_message(EventKind::NeedsHuman, reason.trim());
        }
    }
    if result.success() {
        Event::success()
    } else {
        Event::failure(format!(
            "{agent} exited with code {}: {}",
            result.exit_code,
            result.tail(5)
        ))
    }
}

pub(crate) fn task(state: &WorkflowState) -> anyhow::Result<&str> {
    state
        .get_str("task")
        .filter(|t| !t.trim().is_empty())
        .context("workflow state has no task")
}

/// Open review findings, in the order they were reported.
pub(crate) fn findings(state: &WorkflowState) -> Vec<String> {
    state
        .get("findings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Increment a counter kept in the state.
pub(crate) fn bump(state: &WorkflowState, key: &str) -> u64 {
    state.get_u64(key).unwrap_or(0) + 1
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::agent::testing::{output, ScriptedAgent};
    use crate::ratelimit::{RateLimitConfig, RateLimitCoordinator};
    use crate::workflow::{CheckpointStore, Engine, Outcome};

    pub(crate) fn env(agents: Vec<Arc<ScriptedAgent>>) -> Arc<StepEnv> {
        let mut registry = Registry::new();
        for agent in agents {
            registry.register(agent).unwrap();
        }
        let coordinator = RateLimitCoordinator::new(RateLimitConfig {
            max_waits: 2,
            jitter_fraction: 0.0,
        });
        let mut env = StepEnv::new(registry, AgentRunner::new(Arc::new(coordinator)));
        env.concurrency = 2;
        Arc::new(env)
    }

    pub(crate) fn state_with_task(task: &str) -> WorkflowState {
        let mut state = WorkflowState::new(IMPLEMENT);
        state.set("task", task);
        state
    }

    pub(crate) fn ctx(step: &str) -> crate::workflow::StepContext {
        crate::workflow::StepContext {
            run_id: "run-1".into(),
            step: step.into(),
            cancel: CancellationToken::new(),
        }
    }

    fn roles() -> Roles {
        Roles {
            implementer: "coder".into(),
            reviewers: vec!["alpha".into(), "beta".into()],
            fixer: "coder".into(),
            pr_agent: "coder".into(),
        }
    }

    #[test]
    fn markers_take_precedence() {
        let e = classify_output("a", &output(0, "did some work\nBLOCKED: missing API key"));
        assert_eq!(e.kind, EventKind::Blocked);
        assert_eq!(e.message.as_deref(), Some("missing API key"));

        let e = classify_output("a", &output(1, "  NEEDS_HUMAN: pick a license"));
        assert_eq!(e.kind, EventKind::NeedsHuman);

        assert_eq!(classify_output("a", &output(0, "all good")).kind, EventKind::Success);
        let e = classify_output("a", &output(3, "boom"));
        assert_eq!(e.kind, EventKind::Failure);
        assert!(e.message.unwrap().contains("exited with code 3"));
    }

    #[test]
    fn overrides_replace_rows() {
        let def = default_workflow(&[TransitionRule {
            from: FIX.into(),
            on: EventKind::Failure,
            to: FAILURE_TERMINAL.into(),
        }]);
        assert_eq!(def.transitions.next(FIX, EventKind::Failure), Some(FAILURE_TERMINAL));
        assert_eq!(def.transitions.next(FIX, EventKind::Success), Some(PR));
        assert_eq!(def.initial, IMPLEMENT);
    }

    #[test]
    fn build_steps_requires_known_agents() {
        let env = env(vec![Arc::new(ScriptedAgent::new("coder", vec![]))]);
        let err = build_steps(env, &roles()).err().unwrap();
        assert!(matches!(err, BatonError::UnknownAgent(ref n) if n == "alpha"));
    }

    #[test]
    fn findings_reads_string_array() {
        let mut state = WorkflowState::new(FIX);
        assert!(findings(&state).is_empty());
        state.set("findings", json!(["a", 3, "b"]));
        assert_eq!(findings(&state), vec!["a", "b"]);
    }

    fn built(agents: Vec<Arc<ScriptedAgent>>) -> Steps {
        build_steps(env(agents), &roles()).unwrap()
    }

    fn initial(task: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("task".to_string(), json!(task)),
            ("branch".to_string(), json!("feat/x")),
        ])
    }

    #[tokio::test]
    async fn full_run_with_one_fix_loop() {
        let coder = Arc::new(ScriptedAgent::new(
            "coder",
            vec![
                output(0, "implemented"),
                // fix fails, so implement runs again
                output(1, "could not apply"),
                output(0, "implemented again"),
                output(0, "fixed"),
                output(0, "opened https://github.com/acme/app/pull/7"),
            ],
        ));
        let alpha = Arc::new(ScriptedAgent::new(
            "alpha",
            vec![output(0, "FINDING: missing test"), output(0, "FINDING: Missing test")],
        ));
        let beta = Arc::new(ScriptedAgent::new("beta", vec![output(0, "LGTM"), output(0, "LGTM")]));

        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(
            default_workflow(&[]),
            built(vec![coder.clone(), alpha.clone(), beta]),
            CheckpointStore::new(dir.path()),
            "run-1",
            initial("add login"),
        )
        .unwrap();

        let outcome = engine.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Succeeded);
        assert_eq!(
            engine.state().path(),
            vec![IMPLEMENT, REVIEW, FIX, IMPLEMENT, REVIEW, FIX, PR]
        );
        assert_eq!(
            engine.state().get_str("pr_url"),
            Some("https://github.com/acme/app/pull/7")
        );
        assert_eq!(engine.state().get_u64("implement_runs"), Some(2));
        // the second implement saw the open finding
        assert!(coder.calls()[2].contains("missing test"));
        assert!(engine.state().get("findings").is_none());
    }

    #[tokio::test]
    async fn blocked_implementer_fails_the_run() {
        let coder = Arc::new(ScriptedAgent::new(
            "coder",
            vec![output(0, "BLOCKED: repository is read-only")],
        ));
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(
            default_workflow(&[]),
            built(vec![
                coder,
                Arc::new(ScriptedAgent::new("alpha", vec![])),
                Arc::new(ScriptedAgent::new("beta", vec![])),
            ]),
            CheckpointStore::new(dir.path()),
            "run-2",
            initial("add login"),
        )
        .unwrap();

        assert_eq!(engine.run(&CancellationToken::new()).await.unwrap(), Outcome::Failed);
        assert_eq!(engine.state().events(), vec![EventKind::Blocked]);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_becomes_rate_limited_event() {
        let coder = Arc::new(ScriptedAgent::new(
            "coder",
            vec![output(1, "429"), output(1, "429"), output(1, "429")],
        ));
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::new(
            default_workflow(&[]),
            built(vec![
                coder,
                Arc::new(ScriptedAgent::new("alpha", vec![])),
                Arc::new(ScriptedAgent::new("beta", vec![])),
            ]),
            CheckpointStore::new(dir.path()),
            "run-3",
            initial("add login"),
        )
        .unwrap();

        assert_eq!(engine.run(&CancellationToken::new()).await.unwrap(), Outcome::Failed);
        assert_eq!(engine.state().events(), vec![EventKind::RateLimited]);
    }

    #[test]
    fn dry_run_lists_commands_without_running() {
        let coder = Arc::new(ScriptedAgent::new("coder", vec![]));
        let alpha = Arc::new(ScriptedAgent::new("alpha", vec![]));
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            default_workflow(&[]),
            built(vec![
                coder.clone(),
                alpha.clone(),
                Arc::new(ScriptedAgent::new("beta", vec![])),
            ]),
            CheckpointStore::new(dir.path()),
            "run-4",
            initial("add login"),
        )
        .unwrap();

        let plan = engine.dry_run();
        let steps: Vec<&str> = plan.iter().map(|p| p.step.as_str()).collect();
        assert_eq!(steps, vec![IMPLEMENT, REVIEW, FIX, PR, SUCCESS_TERMINAL]);
        assert!(plan[0].description.contains("coder"));
        assert!(plan[1].description.contains("alpha"));
        assert!(coder.calls().is_empty());
        assert!(alpha.calls().is_empty());
    }
}
