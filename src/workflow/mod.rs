//! Workflow coordination layer.
//!
//! The orchestrator composes agents into declarative patterns (pipeline,
//! parallel, fork-join, debate, conditional, swarm) and an event-driven
//! form (hub-and-spoke or peer pub/sub over the broadcast bus). Every
//! pattern executor acquires the global LLM semaphore around each model
//! call, so the configured concurrency limit holds fabric-wide.

pub mod event;
pub mod orchestrator;
pub mod patterns;
pub mod spec;

pub use event::{WorkflowEvent, WorkflowStatus};
pub use orchestrator::Orchestrator;
pub use spec::{
    CommunicationMode, CommunicationSpec, ConditionalSpec, DebateSpec, EventDrivenSpec,
    ForkJoinSpec, MergeStrategy, ParallelSpec, PipelineSpec, StageSpec, SwarmSpec, SwarmStrategy,
    WorkflowKind, WorkflowSpec,
};

use crate::domain_types::{AgentId, WorkflowId};
use crate::llm::LlmError;
use crate::registry::RegistryError;
use thiserror::Error;

/// Workflow errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The spec is malformed; the field names the offender. Nothing was
    /// persisted or activated.
    #[error("invalid workflow spec: {field} - {reason}")]
    Validation { field: String, reason: String },

    /// A referenced agent does not exist in the registry.
    #[error("unknown agent: {id}")]
    UnknownAgent { id: String },

    /// An agent failed and the pattern does not tolerate it.
    #[error("agent {agent} failed: {message}")]
    AgentFailed { agent: AgentId, message: String },

    /// Fork-join finished with fewer successes than required.
    #[error("only {succeeded} of {required} required agents succeeded")]
    InsufficientSuccesses { required: usize, succeeded: usize },

    /// The classifier produced a label with no matching branch.
    #[error("classifier label '{label}' matches no branch")]
    UnknownBranch { label: String },

    /// Swarm aggregation could not reach a verdict.
    #[error("swarm vote inconclusive under strategy '{strategy}'")]
    Inconclusive { strategy: String },

    /// Repeated output-token-limit failures tripped the circuit breaker.
    #[error("circuit breaker open after {failures} output-token-limit failures in '{stage}'")]
    CircuitOpen { stage: String, failures: u32 },

    /// The run was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// The run exceeded its time budget; partial results were discarded.
    #[error("workflow timed out after {timeout_seconds}s")]
    TimedOut { timeout_seconds: u64 },

    /// No workflow with this id.
    #[error("unknown workflow: {id}")]
    NotFound { id: WorkflowId },

    /// Registry interaction failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An LLM call failed outside any tolerated path.
    #[error(transparent)]
    Llm(#[from] LlmError),
}
