//! Agent registry: identifiers to configurations.
//!
//! Bare ids describe standing agents; composite `workflow:member` ids are
//! created when a workflow activates and torn down when it completes.
//! Reads vastly outnumber writes, so the table sits behind a
//! reader/writer lock.

use crate::domain_types::{AgentId, TopicName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An agent with this id already exists.
    #[error("agent already registered: {id}")]
    AlreadyRegistered { id: AgentId },

    /// No agent with this id.
    #[error("agent not found: {id}")]
    NotFound { id: AgentId },

    /// A composite id could not be formed from the workflow scope and
    /// member name.
    #[error("invalid composite id for workflow '{workflow}' member '{member}'")]
    InvalidComposite { workflow: String, member: String },
}

/// Configuration blob for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Human-readable name.
    pub display_name: String,
    /// System prompt injected at the start of every conversation.
    pub system_prompt: String,
    /// Model override; `None` uses the client default.
    #[serde(default)]
    pub model: Option<String>,
    /// Topics this agent subscribes to when hosted by the runtime.
    #[serde(default)]
    pub topics: Vec<TopicName>,
    /// Free-form extension data.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl AgentConfig {
    /// Minimal config: a display name and system prompt.
    #[must_use]
    pub fn new(display_name: &str, system_prompt: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            system_prompt: system_prompt.to_string(),
            model: None,
            topics: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Maps agent ids (bare or composite) to configurations.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentConfig>>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new agent.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` if the id is taken; the existing
    /// configuration is left untouched.
    #[instrument(skip(self, config), fields(agent_id = %id))]
    pub async fn create_agent(&self, id: AgentId, config: AgentConfig) -> Result<(), RegistryError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered { id });
        }
        agents.insert(id, config);
        Ok(())
    }

    /// Looks up an agent's configuration.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub async fn lookup(&self, id: &AgentId) -> Result<AgentConfig, RegistryError> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
    }

    /// Whether an agent with this id exists.
    pub async fn contains(&self, id: &AgentId) -> bool {
        self.agents.read().await.contains_key(id)
    }

    /// All registered ids, unordered.
    pub async fn list_agents(&self) -> Vec<AgentId> {
        self.agents.read().await.keys().cloned().collect()
    }

    /// Removes an agent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown ids.
    pub async fn deregister(&self, id: &AgentId) -> Result<(), RegistryError> {
        self.agents
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound { id: id.clone() })
    }

    /// Creates the composite `workflow:member` id for every declared
    /// member and returns the ids in declaration order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidComposite` when a member name cannot form a valid
    /// composite id. Members registered before the failure are rolled
    /// back.
    #[instrument(skip(self, members))]
    pub async fn activate_workflow(
        &self,
        workflow: &str,
        members: &[(String, AgentConfig)],
    ) -> Result<Vec<AgentId>, RegistryError> {
        let mut composites = Vec::with_capacity(members.len());
        for (member, config) in members {
            let id = AgentId::composite(workflow, member).map_err(|_| {
                RegistryError::InvalidComposite {
                    workflow: workflow.to_string(),
                    member: member.clone(),
                }
            })?;
            composites.push((id, config.clone()));
        }

        let mut agents = self.agents.write().await;
        for (id, config) in &composites {
            agents.insert(id.clone(), config.clone());
        }
        debug!(workflow, members = composites.len(), "workflow members activated");
        Ok(composites.into_iter().map(|(id, _)| id).collect())
    }

    /// Tears down every composite id scoped to the workflow.
    pub async fn deactivate_workflow(&self, workflow: &str) -> usize {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|id, _| id.workflow_scope() != Some(workflow));
        let removed = before - agents.len();
        if removed > 0 {
            debug!(workflow, removed, "workflow members deactivated");
        }
        removed
    }
}
