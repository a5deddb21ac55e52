use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::EventKind;

#[derive(Debug, Error)]
pub enum BatonError {
    #[error("no transition from step '{step}' on event '{event}'")]
    MissingTransition { step: String, event: EventKind },

    #[error("step '{0}' is not registered")]
    UnknownStep(String),

    #[error("step '{0}' registered twice")]
    DuplicateStep(String),

    #[error("transition from '{step}' on '{event}' targets unknown step '{target}'")]
    UnknownTarget {
        step: String,
        event: EventKind,
        target: String,
    },

    #[error("agent '{0}' registered twice")]
    DuplicateAgent(String),

    #[error("invalid agent name '{name}': {reason}")]
    InvalidAgentName { name: String, reason: &'static str },

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("run '{0}' already has a checkpoint; resume it instead")]
    RunExists(String),

    #[error("no checkpoint found for run '{0}'")]
    CheckpointNotFound(String),

    #[error("checkpoint belongs to workflow '{found}', expected '{expected}'")]
    WorkflowMismatch { expected: String, found: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("agent '{agent}' is not usable: {reason}")]
    Prerequisite { agent: String, reason: String },

    #[error("failed to start agent '{agent}': {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("provider '{provider}' still rate limited after {waits} waits")]
    MaxWaitsExceeded { provider: String, waits: u32 },

    #[error("stopped after {0} transitions without reaching a terminal step")]
    StepLimit(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("checkpoint I/O on {path}: {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BatonError {
    /// True for outcomes caused by the caller stopping work rather than by a
    /// failing agent.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BatonError::Cancelled | BatonError::DeadlineExceeded(_))
    }

    /// Configuration errors are fatal and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BatonError::MissingTransition { .. }
                | BatonError::UnknownStep(_)
                | BatonError::DuplicateStep(_)
                | BatonError::UnknownTarget { .. }
                | BatonError::DuplicateAgent(_)
                | BatonError::InvalidAgentName { .. }
                | BatonError::UnknownAgent(_)
                | BatonError::InvalidRunId(_)
                | BatonError::RunExists(_)
                | BatonError::WorkflowMismatch { .. }
                | BatonError::Config(_)
        )
    }
}

pub type Result<T, E = BatonError> = std::result::Result<T, E>;
