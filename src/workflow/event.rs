use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of step outcomes. The transition table is keyed on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Success,
    Failure,
    Blocked,
    RateLimited,
    NeedsHuman,
    Partial,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Success,
        EventKind::Failure,
        EventKind::Blocked,
        EventKind::RateLimited,
        EventKind::NeedsHuman,
        EventKind::Partial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Success => "success",
            EventKind::Failure => "failure",
            EventKind::Blocked => "blocked",
            EventKind::RateLimited => "rate_limited",
            EventKind::NeedsHuman => "needs_human",
            EventKind::Partial => "partial",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event '{s}'"))
    }
}

/// The single outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn success() -> Self {
        Self::new(EventKind::Success)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::with_message(EventKind::Failure, message)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}
