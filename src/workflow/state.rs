use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{Event, EventKind};

/// One recorded transition: which step ran, what it emitted and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Accumulated facts of a run plus its position in the state machine.
///
/// `data` is a sorted map so the checkpoint on disk has deterministic key
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_step: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl WorkflowState {
    pub fn new(initial_step: impl Into<String>) -> Self {
        Self {
            current_step: initial_step.into(),
            data: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(Value::as_u64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Merge step updates. A `null` value removes the key.
    pub fn apply(&mut self, updates: BTreeMap<String, Value>) {
        for (key, value) in updates {
            if value.is_null() {
                self.data.remove(&key);
            } else {
                self.data.insert(key, value);
            }
        }
    }

    pub(crate) fn record(&mut self, step: &str, event: &Event) {
        self.history.push(HistoryEntry {
            step: step.to_string(),
            event: event.kind,
            message: event.message.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Step names in execution order.
    pub fn path(&self) -> Vec<&str> {
        self.history.iter().map(|h| h.step.as_str()).collect()
    }

    pub fn events(&self) -> Vec<EventKind> {
        self.history.iter().map(|h| h.event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_merges_and_removes() {
        let mut state = WorkflowState::new("implement");
        state.set("task", "add login");
        state.set("findings", json!(["a"]));

        let mut updates = BTreeMap::new();
        updates.insert("findings".to_string(), Value::Null);
        updates.insert("branch".to_string(), json!("feat/login"));
        state.apply(updates);

        assert_eq!(state.get_str("task"), Some("add login"));
        assert_eq!(state.get_str("branch"), Some("feat/login"));
        assert!(state.get("findings").is_none());
    }

    #[test]
    fn record_appends_history_in_order() {
        let mut state = WorkflowState::new("implement");
        state.record("implement", &Event::success());
        state.record("review", &Event::failure("no reviewers"));

        assert_eq!(state.path(), vec!["implement", "review"]);
        assert_eq!(state.events(), vec![EventKind::Success, EventKind::Failure]);
        assert_eq!(state.history[1].message.as_deref(), Some("no reviewers"));
    }
}
