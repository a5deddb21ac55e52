use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::Agent;
use crate::error::{BatonError, Result};

/// Agent names are config keys and provider ids: lowercase ascii letters,
/// digits, `-` and `_`, starting with a letter.
pub fn validate_agent_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(BatonError::InvalidAgentName {
            name: name.to_string(),
            reason,
        })
    };
    let Some(first) = name.chars().next() else {
        return invalid("name is empty");
    };
    if !first.is_ascii_lowercase() {
        return invalid("must start with a lowercase letter");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return invalid("only lowercase letters, digits, '-' and '_' are allowed");
    }
    Ok(())
}

/// Name-keyed set of available agents.
#[derive(Default, Clone)]
pub struct Registry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let name = agent.name().to_string();
        validate_agent_name(&name)?;
        if self.agents.contains_key(&name) {
            return Err(BatonError::DuplicateAgent(name));
        }
        debug!(agent = %name, "agent registered");
        self.agents.insert(name, agent);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| BatonError::UnknownAgent(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Check the named agents (all of them when `names` is empty), stopping
    /// at the first one that is missing or unusable.
    pub fn check_prerequisites(&self, names: &[String]) -> Result<()> {
        let names = if names.is_empty() {
            self.names()
        } else {
            names.to_vec()
        };
        for name in &names {
            self.get(name)?.check_prerequisites()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("agents", &self.names())
            .finish()
    }
}
