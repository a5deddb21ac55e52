mod checkpoint;
mod engine;
mod event;
mod state;
mod transition;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use engine::{
    Engine, EngineUpdate, PlannedStep, StepContext, StepHandler, StepOutput, Steps,
    DEFAULT_MAX_TRANSITIONS,
};
pub use event::{Event, EventKind};
pub use state::{HistoryEntry, WorkflowState};
pub use transition::{
    is_terminal, Outcome, TransitionRule, TransitionTable, WorkflowDefinition, FAILURE_TERMINAL,
    SUCCESS_TERMINAL,
};
