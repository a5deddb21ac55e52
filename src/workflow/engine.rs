use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, CheckpointStore};
use super::event::{Event, EventKind};
use super::state::WorkflowState;
use super::transition::{is_terminal, Outcome, WorkflowDefinition, SUCCESS_TERMINAL};
use crate::error::{BatonError, Result};

/// Default ceiling on transitions taken by one [`Engine::run`] call.
pub const DEFAULT_MAX_TRANSITIONS: usize = 50;

/// What a handler sees while it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step: String,
    pub cancel: CancellationToken,
}

/// The single event a step emits plus the facts it wants merged into the
/// workflow state. A `null` update removes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub event: Event,
    pub updates: BTreeMap<String, Value>,
}

impl StepOutput {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            updates: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.updates.insert(key.into(), value.into());
        self
    }
}

/// A unit of work in a workflow.
///
/// `execute` may run more than once for the same run: a step interrupted
/// before its checkpoint was written starts again from scratch on resume.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Events this step can emit. Every one of them needs a transition.
    fn emits(&self) -> &'static [EventKind] {
        &[EventKind::Success, EventKind::Failure]
    }

    async fn execute(&self, ctx: &StepContext, state: &WorkflowState) -> anyhow::Result<StepOutput>;

    /// Side-effect free description of what `execute` would do.
    fn describe(&self, state: &WorkflowState) -> String;
}

/// Step handlers keyed by step name. Frozen once handed to an [`Engine`].
#[derive(Clone, Default)]
pub struct Steps {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl Steps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        let name = name.into();
        if is_terminal(&name) || self.handlers.contains_key(&name) {
            return Err(BatonError::DuplicateStep(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn with(mut self, name: &str, handler: Arc<dyn StepHandler>) -> Result<Self> {
        self.register(name, handler)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn StepHandler>> {
        self.handlers.get(name)
    }
}

/// Progress notifications for a presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    StepStarted {
        run_id: String,
        step: String,
    },
    StepFinished {
        run_id: String,
        step: String,
        event: Event,
        next: String,
    },
    Finished {
        run_id: String,
        outcome: Outcome,
    },
}

/// One line of a dry-run preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step: String,
    pub description: String,
}

/// Drives one run through its workflow, one step at a time.
pub struct Engine {
    definition: WorkflowDefinition,
    steps: Steps,
    store: CheckpointStore,
    run_id: String,
    state: WorkflowState,
    max_transitions: usize,
    updates: Option<UnboundedSender<EngineUpdate>>,
}

impl Engine {
    /// Start a fresh run. Fails if the workflow is malformed or the run id
    /// already has a checkpoint.
    pub fn new(
        definition: WorkflowDefinition,
        steps: Steps,
        store: CheckpointStore,
        run_id: impl Into<String>,
        initial_data: BTreeMap<String, Value>,
    ) -> Result<Self> {
        validate(&definition, &steps)?;
        let run_id = run_id.into();
        if store.exists(&run_id)? {
            return Err(BatonError::RunExists(run_id));
        }

        let mut state = WorkflowState::new(definition.initial.clone());
        state.apply(initial_data);
        let engine = Self::assemble(definition, steps, store, run_id, state);
        engine.persist()?;
        info!(run_id = %engine.run_id, workflow = %engine.definition.name, "run started");
        Ok(engine)
    }

    /// Continue a run from its checkpoint in `store`.
    pub fn resume(
        definition: WorkflowDefinition,
        steps: Steps,
        store: CheckpointStore,
        run_id: &str,
    ) -> Result<Self> {
        let checkpoint = store.load(run_id)?;
        Self::from_checkpoint(definition, steps, store, checkpoint)
    }

    /// Continue a run from an explicit checkpoint file. Later checkpoints are
    /// written next to it.
    pub fn resume_from_path(
        definition: WorkflowDefinition,
        steps: Steps,
        path: &Path,
    ) -> Result<Self> {
        let checkpoint = CheckpointStore::load_path(path)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_checkpoint(definition, steps, CheckpointStore::new(dir), checkpoint)
    }

    fn from_checkpoint(
        definition: WorkflowDefinition,
        steps: Steps,
        store: CheckpointStore,
        checkpoint: Checkpoint,
    ) -> Result<Self> {
        validate(&definition, &steps)?;
        if checkpoint.workflow != definition.name {
            return Err(BatonError::WorkflowMismatch {
                expected: definition.name,
                found: checkpoint.workflow,
            });
        }
        let current = checkpoint.current_step.as_str();
        if !is_terminal(current) && steps.get(current).is_none() {
            return Err(BatonError::UnknownStep(current.to_string()));
        }

        let run_id = checkpoint.run_id.clone();
        info!(run_id = %run_id, step = %checkpoint.current_step, "resuming run");
        Ok(Self::assemble(
            definition,
            steps,
            store,
            run_id,
            checkpoint.into_state(),
        ))
    }

    fn assemble(
        definition: WorkflowDefinition,
        steps: Steps,
        store: CheckpointStore,
        run_id: String,
        state: WorkflowState,
    ) -> Self {
        Self {
            definition,
            steps,
            store,
            run_id,
            state,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
            updates: None,
        }
    }

    pub fn with_updates(mut self, tx: UnboundedSender<EngineUpdate>) -> Self {
        self.updates = Some(tx);
        self
    }

    pub fn with_max_transitions(mut self, max: usize) -> Self {
        self.max_transitions = max.max(1);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn outcome(&self) -> Option<Outcome> {
        Outcome::for_terminal(&self.state.current_step)
    }

    /// Execute the current step, take its transition and checkpoint.
    /// Returns the outcome once a terminal step is reached.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<Option<Outcome>> {
        if let Some(outcome) = self.outcome() {
            return Ok(Some(outcome));
        }
        if cancel.is_cancelled() {
            return Err(BatonError::Cancelled);
        }

        let step = self.state.current_step.clone();
        let handler = self
            .steps
            .get(&step)
            .cloned()
            .ok_or_else(|| BatonError::UnknownStep(step.clone()))?;
        let ctx = StepContext {
            run_id: self.run_id.clone(),
            step: step.clone(),
            cancel: cancel.clone(),
        };

        self.publish(EngineUpdate::StepStarted {
            run_id: self.run_id.clone(),
            step: step.clone(),
        });
        info!(run_id = %self.run_id, step = %step, "step started");

        let output = match handler.execute(&ctx, &self.state).await {
            Ok(output) => output,
            Err(err) => classify_error(err)?,
        };

        let event = output.event;
        let next = self
            .definition
            .transitions
            .next(&step, event.kind)
            .ok_or_else(|| BatonError::MissingTransition {
                step: step.clone(),
                event: event.kind,
            })?
            .to_string();

        self.state.apply(output.updates);
        self.state.record(&step, &event);
        self.state.current_step = next.clone();
        self.persist()?;

        info!(run_id = %self.run_id, step = %step, event = %event.kind, next = %next, "transition");
        self.publish(EngineUpdate::StepFinished {
            run_id: self.run_id.clone(),
            step,
            event,
            next,
        });

        let outcome = self.outcome();
        if let Some(outcome) = outcome {
            info!(run_id = %self.run_id, ?outcome, "run finished");
            self.publish(EngineUpdate::Finished {
                run_id: self.run_id.clone(),
                outcome,
            });
        }
        Ok(outcome)
    }

    /// Step until a terminal step is reached, cancellation, or the transition
    /// ceiling.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Outcome> {
        if let Some(outcome) = self.outcome() {
            return Ok(outcome);
        }
        for _ in 0..self.max_transitions {
            if let Some(outcome) = self.step(cancel).await? {
                return Ok(outcome);
            }
        }
        warn!(run_id = %self.run_id, max = self.max_transitions, "transition ceiling reached");
        Err(BatonError::StepLimit(self.max_transitions))
    }

    /// Describe the steps a fully successful run would take from here,
    /// without executing anything.
    pub fn dry_run(&self) -> Vec<PlannedStep> {
        plan(&self.definition, &self.steps, &self.state)
    }

    /// Dry run of a run that has not started. Validates the workflow but
    /// writes no checkpoint.
    pub fn preview(
        definition: &WorkflowDefinition,
        steps: &Steps,
        initial_data: BTreeMap<String, Value>,
    ) -> Result<Vec<PlannedStep>> {
        validate(definition, steps)?;
        let mut state = WorkflowState::new(definition.initial.clone());
        state.apply(initial_data);
        Ok(plan(definition, steps, &state))
    }

    fn persist(&self) -> Result<()> {
        let checkpoint = Checkpoint::capture(&self.run_id, &self.definition.name, &self.state);
        self.store.save(&checkpoint)?;
        Ok(())
    }

    fn publish(&self, update: EngineUpdate) {
        if let Some(tx) = &self.updates
            && tx.send(update).is_err()
        {
            debug!(run_id = %self.run_id, "update receiver dropped");
        }
    }
}

/// Follow `success` transitions from the current step, visiting each step
/// once.
fn plan(definition: &WorkflowDefinition, steps: &Steps, state: &WorkflowState) -> Vec<PlannedStep> {
    let mut planned = Vec::new();
    let mut visited = HashSet::new();
    let mut step = state.current_step.clone();
    while !is_terminal(&step) && visited.insert(step.clone()) {
        let Some(handler) = steps.get(&step) else {
            break;
        };
        planned.push(PlannedStep {
            step: step.clone(),
            description: handler.describe(state),
        });
        match definition.transitions.next(&step, EventKind::Success) {
            Some(next) => step = next.to_string(),
            None => break,
        }
    }
    if step == SUCCESS_TERMINAL {
        planned.push(PlannedStep {
            step,
            description: "workflow complete".to_string(),
        });
    }
    planned
}

/// Map a handler error onto the event set. Cancellation is never an event:
/// it aborts the cycle without advancing.
fn classify_error(err: anyhow::Error) -> Result<StepOutput> {
    match err.downcast::<BatonError>() {
        Ok(e) if e.is_cancellation() || e.is_configuration() => Err(e),
        Ok(e @ BatonError::MaxWaitsExceeded { .. }) => Ok(StepOutput::new(Event::with_message(
            EventKind::RateLimited,
            e.to_string(),
        ))),
        Ok(e) => Ok(StepOutput::new(Event::failure(e.to_string()))),
        Err(other) => Ok(StepOutput::new(Event::failure(format!("{other:#}")))),
    }
}

/// Every reachable step must be registered and have a transition for each
/// event it emits, and every target must exist.
fn validate(definition: &WorkflowDefinition, steps: &Steps) -> Result<()> {
    let table = &definition.transitions;
    for step in table.reachable_from(&definition.initial) {
        let handler = steps
            .get(&step)
            .ok_or_else(|| BatonError::UnknownStep(step.clone()))?;
        for &event in handler.emits() {
            if table.next(&step, event).is_none() {
                return Err(BatonError::MissingTransition { step, event });
            }
        }
        for (event, target) in table.outgoing(&step) {
            if !is_terminal(target) && steps.get(target).is_none() {
                return Err(BatonError::UnknownTarget {
                    step: step.clone(),
                    event,
                    target: target.to_string(),
                });
            }
        }
    }
    Ok(())
}
