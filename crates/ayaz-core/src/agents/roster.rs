//! Agent roster — ordered registry of the crew's agents

use tracing::{debug, warn};

use super::profile::AgentProfile;

/// Named agent profiles, kept in declaration order
#[derive(Debug, Clone, Default)]
pub struct AgentRoster {
    agents: Vec<(String, AgentProfile)>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Returns false (and keeps the existing one) on a duplicate name.
    pub fn add(&mut self, name: impl Into<String>, profile: AgentProfile) -> bool {
        let name = name.into();
        if self.get(&name).is_some() {
            warn!("AgentRoster: agent '{}' already registered, ignoring duplicate", name);
            return false;
        }
        debug!("AgentRoster: added agent '{}' ({})", name, profile.role.trim());
        self.agents.push((name, profile));
        true
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.agents
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, profile)| profile)
    }

    /// Agent names in declaration order
    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AgentProfile)> {
        self.agents.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
