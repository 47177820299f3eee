use std::collections::HashMap;
use std::sync::Arc;
use voxline_types::AgentProfile;

/// Read-only set of agent profiles a call can select.
#[derive(Debug, Clone)]
pub struct AgentProfileStore {
    profiles: HashMap<String, Arc<AgentProfile>>,
    default: Arc<AgentProfile>,
}

impl AgentProfileStore {
    /// Builds the store from configured agents.
    ///
    /// The default is `default_id` when it names a configured agent, else the
    /// first configured agent, else the built-in profile.
    pub fn new(agents: Vec<AgentProfile>, default_id: Option<&str>) -> Self {
        let first = agents.first().map(|a| a.id.clone());
        let profiles: HashMap<String, Arc<AgentProfile>> = agents
            .into_iter()
            .map(|agent| (agent.id.clone(), Arc::new(agent)))
            .collect();

        let default = default_id
            .map(str::to_string)
            .or(first)
            .and_then(|id| profiles.get(&id).cloned())
            .unwrap_or_else(|| Arc::new(AgentProfile::default()));

        Self { profiles, default }
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentProfile>> {
        self.profiles.get(id).cloned()
    }

    /// Profile for a call; unknown or absent ids get the default.
    pub fn resolve(&self, id: Option<&str>) -> Arc<AgentProfile> {
        match id.and_then(|id| self.get(id)) {
            Some(profile) => profile,
            None => {
                if let Some(id) = id {
                    tracing::debug!(agent = id, "unknown agent id, using default profile");
                }
                self.default.clone()
            }
        }
    }

    pub fn default_profile(&self) -> Arc<AgentProfile> {
        self.default.clone()
    }
}

impl Default for AgentProfileStore {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}
