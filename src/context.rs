//! Execution context threaded through agent and workflow code paths.
//!
//! A `RunContext` carries cancellation plus the identifiers that telemetry
//! and the shared memory need: the session id of the conversation and the
//! id of the agent doing the work. Identifiers are reachable both through
//! typed accessors and through string keys, for call sites that treat the
//! context as an opaque bag.

use crate::domain_types::{AgentId, SessionId};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// String key under which the session id is mirrored in the extras map.
pub const SESSION_ID_KEY: &str = "session_id";
/// String key under which the agent id is mirrored in the extras map.
pub const AGENT_ID_KEY: &str = "agent_id";

/// Cancellation, identity, and ad-hoc values for one unit of work.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    session_id: Option<SessionId>,
    agent_id: Option<AgentId>,
    extras: HashMap<String, String>,
}

impl RunContext {
    /// A root context with a fresh cancellation token and no identity.
    #[must_use]
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
            session_id: None,
            agent_id: None,
            extras: HashMap::new(),
        }
    }

    /// A child context: cancelling the parent cancels the child, not the
    /// other way around.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            session_id: self.session_id,
            agent_id: self.agent_id.clone(),
            extras: self.extras.clone(),
        }
    }

    /// Attaches a session id, mirrored under [`SESSION_ID_KEY`].
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.extras
            .insert(SESSION_ID_KEY.to_string(), session_id.to_string());
        self.session_id = Some(session_id);
        self
    }

    /// Attaches an agent id, mirrored under [`AGENT_ID_KEY`].
    #[must_use]
    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.extras
            .insert(AGENT_ID_KEY.to_string(), agent_id.to_string());
        self.agent_id = Some(agent_id);
        self
    }

    /// Attaches an arbitrary string value.
    #[must_use]
    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.extras.insert(key.to_string(), value.to_string());
        self
    }

    /// The session id, if one was attached.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// The agent id, if one was attached.
    #[must_use]
    pub fn agent_id(&self) -> Option<&AgentId> {
        self.agent_id.as_ref()
    }

    /// Looks up a value by string key. Typed identifiers are visible here
    /// too, under their well-known keys.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    /// The cancellation token backing this context.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Requests cancellation of this context and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::root()
    }
}
