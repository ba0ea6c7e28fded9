//! Workflow spec parsing and validation.
//!
//! A workflow document is JSON with a top-level `type` field naming the
//! pattern (strictly `type`; `pattern` is rejected with a pointer at the
//! right field). The event-driven form replaces `type` with `entrypoint`
//! plus `agents[]` and an optional `communication` descriptor; which key
//! is present dictates the code path.
//!
//! Validation failures name the offending field precisely, and nothing is
//! persisted or activated until validation has passed.

use crate::workflow::WorkflowError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Agent that runs the stage.
    pub agent: String,
    /// Stage-specific prompt prefix; the previous stage's output is
    /// appended.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Pipeline: stage *i+1* receives the output of stage *i*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    /// Keep going when a stage fails, passing the previous output onward.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Pass the full stage history to every stage instead of only the
    /// previous output.
    #[serde(default)]
    pub shared_context: bool,
}

/// One parallel participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelAgentSpec {
    pub agent: String,
    /// Per-agent prompt override.
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Parallel: all agents invoked simultaneously; all must succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    #[serde(default)]
    pub agents: Vec<ParallelAgentSpec>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
}

/// How fork-join folds its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Join outputs under per-agent headings.
    Concatenate,
    /// Pick the most common normalized output.
    Vote,
    /// Ask a merge agent to synthesize the outputs.
    Summarize,
}

/// Fork-join: parallel fan-out plus a merge stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkJoinSpec {
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub merge_strategy: Option<MergeStrategy>,
    /// Agent performing the `summarize` merge; defaults to the first
    /// participant.
    #[serde(default)]
    pub merge_agent: Option<String>,
    /// Individual failures are tolerated while at least this many agents
    /// succeed. Defaults to all of them.
    #[serde(default)]
    pub min_successes: Option<usize>,
}

/// Debate: alternating rounds across debaters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSpec {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub rounds: Option<u32>,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    /// Optional moderator that synthesizes the final answer.
    #[serde(default)]
    pub moderator: Option<String>,
}

/// Conditional: a classifier label selects the branch agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalSpec {
    #[serde(default)]
    pub classifier: Option<String>,
    #[serde(default)]
    pub branches: std::collections::BTreeMap<String, String>,
    /// Branch used when the classifier emits an unknown label.
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// How swarm verdicts are aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStrategy {
    /// Strictly more than half of the counted votes.
    Majority,
    /// At least two thirds of the counted votes.
    Supermajority,
    /// Every counted vote agrees.
    Unanimous,
}

/// Swarm: N voters emit verdicts; aggregation decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSpec {
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub strategy: Option<SwarmStrategy>,
    /// Votes below this confidence are not counted.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Optional tie-breaker.
    #[serde(default)]
    pub judge: Option<String>,
}

fn default_confidence_threshold() -> f32 {
    0.5
}

/// How event-driven members communicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationMode {
    /// Spokes message the entrypoint; the entrypoint broadcasts back.
    #[default]
    HubAndSpoke,
    /// Every member publishes and subscribes on shared topics.
    PeerPubSub,
}

/// Communication descriptor for the event-driven form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunicationSpec {
    #[serde(default)]
    pub mode: CommunicationMode,
    /// Topic names; a scope-derived default is used when empty.
    #[serde(default)]
    pub topics: Vec<String>,
}

/// One event-driven member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAgentSpec {
    pub id: String,
    /// Inline configuration; when absent the bare id is resolved against
    /// the registry.
    #[serde(default)]
    pub config: Option<crate::registry::AgentConfig>,
}

/// Event-driven form: an entrypoint plus communicating members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDrivenSpec {
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub agents: Vec<EventAgentSpec>,
    #[serde(default)]
    pub communication: Option<CommunicationSpec>,
    /// Conversation rounds before the run settles.
    #[serde(default = "default_event_rounds")]
    pub max_rounds: u32,
}

fn default_event_rounds() -> u32 {
    5
}

/// The pattern payload of a workflow.
#[derive(Debug, Clone)]
pub enum WorkflowKind {
    Pipeline(PipelineSpec),
    Parallel(ParallelSpec),
    ForkJoin(ForkJoinSpec),
    Debate(DebateSpec),
    Conditional(ConditionalSpec),
    Swarm(SwarmSpec),
    EventDriven(EventDrivenSpec),
}

impl WorkflowKind {
    /// Stable name of the pattern.
    #[must_use]
    pub fn pattern_name(&self) -> &'static str {
        match self {
            Self::Pipeline(_) => "pipeline",
            Self::Parallel(_) => "parallel",
            Self::ForkJoin(_) => "fork_join",
            Self::Debate(_) => "debate",
            Self::Conditional(_) => "conditional",
            Self::Swarm(_) => "swarm",
            Self::EventDriven(_) => "event-driven",
        }
    }
}

/// A validated workflow document.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    /// Workflow scope name used for composite member ids.
    pub name: Option<String>,
    /// Wall-clock budget for the whole run.
    pub timeout_seconds: Option<u64>,
    /// The pattern payload.
    pub kind: WorkflowKind,
}

fn missing(field: &str) -> WorkflowError {
    WorkflowError::Validation {
        field: field.to_string(),
        reason: "required field is missing".to_string(),
    }
}

fn invalid(field: &str, reason: &str) -> WorkflowError {
    WorkflowError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn deserialize<T: serde::de::DeserializeOwned>(doc: &Value) -> Result<T, WorkflowError> {
    serde_json::from_value(doc.clone()).map_err(|e| WorkflowError::Validation {
        field: "spec".to_string(),
        reason: e.to_string(),
    })
}

impl WorkflowSpec {
    /// Parses and validates a workflow document.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::Validation` naming the field that is
    /// missing or malformed.
    pub fn parse(doc: &Value) -> Result<Self, WorkflowError> {
        let object = doc
            .as_object()
            .ok_or_else(|| invalid("spec", "workflow spec must be a JSON object"))?;

        let name = match object.get("name") {
            Some(Value::String(name)) => Some(name.clone()),
            Some(_) => return Err(invalid("name", "must be a string")),
            None => None,
        };
        if let Some(name) = &name {
            if name.is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
                return Err(invalid(
                    "name",
                    "must be non-empty without ':' or whitespace",
                ));
            }
        }

        let timeout_seconds = match object.get("timeout_seconds") {
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| invalid("timeout_seconds", "must be a positive integer"))?,
            ),
            None => None,
        };

        let kind = if object.contains_key("entrypoint") {
            WorkflowKind::EventDriven(deserialize(doc)?)
        } else {
            let pattern = match object.get("type") {
                Some(Value::String(pattern)) => pattern.as_str(),
                Some(_) => return Err(invalid("type", "must be a string")),
                None if object.contains_key("pattern") => {
                    return Err(invalid(
                        "type",
                        "workflow specs name the pattern under 'type', not 'pattern'",
                    ));
                }
                None => return Err(missing("type")),
            };

            match pattern {
                "pipeline" => WorkflowKind::Pipeline(deserialize(doc)?),
                "parallel" => WorkflowKind::Parallel(deserialize(doc)?),
                "fork_join" => WorkflowKind::ForkJoin(deserialize(doc)?),
                "debate" => WorkflowKind::Debate(deserialize(doc)?),
                "conditional" => WorkflowKind::Conditional(deserialize(doc)?),
                "swarm" => WorkflowKind::Swarm(deserialize(doc)?),
                unknown => {
                    return Err(invalid("type", &format!("unknown pattern '{unknown}'")));
                }
            }
        };

        let spec = Self {
            name,
            timeout_seconds,
            kind,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// All member names the pattern references, deduplicated in first-use
    /// order.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !members.iter().any(|m| m == name) {
                members.push(name.to_string());
            }
        };
        match &self.kind {
            WorkflowKind::Pipeline(spec) => {
                for stage in &spec.stages {
                    push(&stage.agent);
                }
            }
            WorkflowKind::Parallel(spec) => {
                for entry in &spec.agents {
                    push(&entry.agent);
                }
            }
            WorkflowKind::ForkJoin(spec) => {
                for id in &spec.agent_ids {
                    push(id);
                }
                if let Some(merge_agent) = &spec.merge_agent {
                    push(merge_agent);
                }
            }
            WorkflowKind::Debate(spec) => {
                for id in &spec.agent_ids {
                    push(id);
                }
                if let Some(moderator) = &spec.moderator {
                    push(moderator);
                }
            }
            WorkflowKind::Conditional(spec) => {
                if let Some(classifier) = &spec.classifier {
                    push(classifier);
                }
                for branch in spec.branches.values() {
                    push(branch);
                }
                if let Some(default_branch) = &spec.default_branch {
                    push(default_branch);
                }
            }
            WorkflowKind::Swarm(spec) => {
                for id in &spec.agent_ids {
                    push(id);
                }
                if let Some(judge) = &spec.judge {
                    push(judge);
                }
            }
            WorkflowKind::EventDriven(spec) => {
                for entry in &spec.agents {
                    push(&entry.id);
                }
            }
        }
        members
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        match &self.kind {
            WorkflowKind::Pipeline(spec) => {
                if spec.initial_prompt.is_none() {
                    return Err(missing("initial_prompt"));
                }
                if spec.stages.is_empty() {
                    return Err(invalid("stages", "at least one stage is required"));
                }
            }
            WorkflowKind::Parallel(spec) => {
                if spec.agents.is_empty() {
                    return Err(invalid("agents", "at least one agent is required"));
                }
                if spec.prompt.is_none() && spec.agents.iter().any(|a| a.prompt.is_none()) {
                    return Err(invalid(
                        "prompt",
                        "required unless every agent carries its own prompt",
                    ));
                }
            }
            WorkflowKind::ForkJoin(spec) => {
                if spec.agent_ids.is_empty() {
                    return Err(invalid("agent_ids", "at least one agent is required"));
                }
                if spec.prompt.is_none() {
                    return Err(missing("prompt"));
                }
                if spec.merge_strategy.is_none() {
                    return Err(missing("merge_strategy"));
                }
                if let Some(min) = spec.min_successes {
                    if min == 0 || min > spec.agent_ids.len() {
                        return Err(invalid(
                            "min_successes",
                            "must be between 1 and the number of agents",
                        ));
                    }
                }
            }
            WorkflowKind::Debate(spec) => {
                if spec.topic.is_none() {
                    return Err(missing("topic"));
                }
                if spec.rounds.is_none_or(|rounds| rounds == 0) {
                    return Err(invalid("rounds", "at least one round is required"));
                }
                if spec.agent_ids.len() < 2 {
                    return Err(invalid("agent_ids", "a debate needs at least two agents"));
                }
            }
            WorkflowKind::Conditional(spec) => {
                if spec.classifier.is_none() {
                    return Err(missing("classifier"));
                }
                if spec.branches.is_empty() {
                    return Err(invalid("branches", "at least one branch is required"));
                }
            }
            WorkflowKind::Swarm(spec) => {
                if spec.agent_ids.is_empty() {
                    return Err(invalid("agent_ids", "at least one voter is required"));
                }
                if spec.prompt.is_none() {
                    return Err(missing("prompt"));
                }
                if spec.strategy.is_none() {
                    return Err(missing("strategy"));
                }
                if !(0.0..=1.0).contains(&spec.confidence_threshold) {
                    return Err(invalid(
                        "confidence_threshold",
                        "must be between 0.0 and 1.0",
                    ));
                }
            }
            WorkflowKind::EventDriven(spec) => {
                let Some(entrypoint) = &spec.entrypoint else {
                    return Err(missing("entrypoint"));
                };
                if entrypoint.is_empty() {
                    return Err(invalid("entrypoint", "must be non-empty"));
                }
                if spec.agents.is_empty() {
                    return Err(invalid("agents", "at least one agent is required"));
                }
                if !spec.agents.iter().any(|a| &a.id == entrypoint) {
                    return Err(invalid("entrypoint", "must be one of the declared agents"));
                }
                if spec.max_rounds == 0 {
                    return Err(invalid("max_rounds", "at least one round is required"));
                }
            }
        }
        Ok(())
    }
}
