use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::event::EventKind;

/// Terminal step reached when a workflow completes successfully.
pub const SUCCESS_TERMINAL: &str = "done";
/// Terminal step reached when a workflow gives up.
pub const FAILURE_TERMINAL: &str = "failed";

pub fn is_terminal(step: &str) -> bool {
    step == SUCCESS_TERMINAL || step == FAILURE_TERMINAL
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn for_terminal(step: &str) -> Option<Outcome> {
        match step {
            SUCCESS_TERMINAL => Some(Outcome::Succeeded),
            FAILURE_TERMINAL => Some(Outcome::Failed),
            _ => None,
        }
    }
}

/// One `(from, on) -> to` row, the shape transitions take in config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from: String,
    pub on: EventKind,
    pub to: String,
}

/// Maps `(step, event)` to the next step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionTable {
    rows: BTreeMap<String, BTreeMap<EventKind, String>>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a transition.
    pub fn add(&mut self, from: impl Into<String>, on: EventKind, to: impl Into<String>) {
        self.rows.entry(from.into()).or_default().insert(on, to.into());
    }

    /// Builder form of [`add`](Self::add).
    pub fn on(mut self, from: &str, on: EventKind, to: &str) -> Self {
        self.add(from, on, to);
        self
    }

    /// Route several events from one step to the same target.
    pub fn on_any(mut self, from: &str, events: &[EventKind], to: &str) -> Self {
        for &event in events {
            self.add(from, event, to);
        }
        self
    }

    pub fn next(&self, from: &str, on: EventKind) -> Option<&str> {
        self.rows.get(from)?.get(&on).map(String::as_str)
    }

    pub fn outgoing(&self, from: &str) -> impl Iterator<Item = (EventKind, &str)> {
        self.rows
            .get(from)
            .into_iter()
            .flat_map(|row| row.iter().map(|(event, to)| (*event, to.as_str())))
    }

    /// Non-terminal steps reachable from `initial`, in breadth-first order.
    pub fn reachable_from(&self, initial: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([initial.to_string()]);
        while let Some(step) = queue.pop_front() {
            if is_terminal(&step) || !seen.insert(step.clone()) {
                continue;
            }
            for (_, to) in self.outgoing(&step) {
                queue.push_back(to.to_string());
            }
            order.push(step);
        }
        order
    }

    pub fn rules(&self) -> Vec<TransitionRule> {
        self.rows
            .iter()
            .flat_map(|(from, row)| {
                row.iter().map(move |(on, to)| TransitionRule {
                    from: from.clone(),
                    on: *on,
                    to: to.clone(),
                })
            })
            .collect()
    }
}

impl FromIterator<TransitionRule> for TransitionTable {
    fn from_iter<I: IntoIterator<Item = TransitionRule>>(iter: I) -> Self {
        let mut table = TransitionTable::new();
        for rule in iter {
            table.add(rule.from, rule.on, rule.to);
        }
        table
    }
}

/// A named workflow: where it starts and how steps connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub initial: String,
    pub transitions: TransitionTable,
}

impl WorkflowDefinition {
    pub fn new(
        name: impl Into<String>,
        initial: impl Into<String>,
        transitions: TransitionTable,
    ) -> Self {
        Self {
            name: name.into(),
            initial: initial.into(),
            transitions,
        }
    }
}
