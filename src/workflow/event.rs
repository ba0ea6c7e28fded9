//! Events and status reporting for workflow runs.

use crate::domain_types::{AgentId, WorkflowId};
use crate::llm::TokenUsage;
use serde::Serialize;

/// Progress events streamed to the caller of `RunWorkflow`.
///
/// Delivery is best-effort: a slow caller may miss events, but terminal
/// state is always visible through `GetWorkflowStatus`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The run was accepted and its members activated.
    Started {
        workflow_id: WorkflowId,
        pattern: String,
    },
    /// A pipeline stage (or equivalent unit) began.
    StageStarted { stage: usize, agent: AgentId },
    /// An agent produced output.
    AgentCompleted {
        agent: AgentId,
        output: String,
        usage: TokenUsage,
    },
    /// An agent failed; whether the run continues depends on the pattern.
    AgentFailed { agent: AgentId, error: String },
    /// A debate or event-driven round finished.
    RoundCompleted { round: u32 },
    /// The merge stage produced its output.
    MergeCompleted { strategy: String, output: String },
    /// Terminal: the run finished.
    Completed { output: String, usage: TokenUsage },
    /// Terminal: the run failed.
    Failed { error: String },
    /// Terminal: the run was cancelled.
    Cancelled,
    /// Terminal: the run exceeded its time budget.
    TimedOut { timeout_seconds: u64 },
}

/// Live status of a workflow instance.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// The run is executing.
    Running {
        /// Last stage that started (0-based), if any.
        stage: Option<usize>,
        /// Rounds completed so far.
        rounds_completed: u32,
    },
    /// Terminal success.
    Completed { output: String },
    /// Terminal failure.
    Failed { error: String },
    /// Terminal cancellation.
    Cancelled,
    /// Terminal timeout.
    TimedOut { timeout_seconds: u64 },
}

impl WorkflowStatus {
    /// Whether the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }

    /// Folds an event into the status.
    pub fn apply(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::StageStarted { stage, .. } => {
                if let Self::Running { stage: current, .. } = self {
                    *current = Some(*stage);
                }
            }
            WorkflowEvent::RoundCompleted { round } => {
                if let Self::Running {
                    rounds_completed, ..
                } = self
                {
                    *rounds_completed = (*rounds_completed).max(*round);
                }
            }
            WorkflowEvent::Completed { output, .. } => {
                *self = Self::Completed {
                    output: output.clone(),
                };
            }
            WorkflowEvent::Failed { error } => {
                *self = Self::Failed {
                    error: error.clone(),
                };
            }
            WorkflowEvent::Cancelled => *self = Self::Cancelled,
            WorkflowEvent::TimedOut { timeout_seconds } => {
                *self = Self::TimedOut {
                    timeout_seconds: *timeout_seconds,
                };
            }
            WorkflowEvent::Started { .. }
            | WorkflowEvent::AgentCompleted { .. }
            | WorkflowEvent::AgentFailed { .. }
            | WorkflowEvent::MergeCompleted { .. } => {}
        }
    }
}
