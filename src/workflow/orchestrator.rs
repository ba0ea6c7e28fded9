//! Executes workflow patterns against the fabric.
//!
//! The orchestrator parses and validates the spec (nothing is activated
//! until validation passes), activates composite member ids, spawns the
//! pattern executor under a cancellation token and wall-clock budget, and
//! streams progress events to the caller. It owns the only reference to
//! the global LLM semaphore outside the agent runtime and threads it into
//! every executor.

use crate::broadcast::BroadcastBus;
use crate::domain_types::{AgentId, WorkflowId};
use crate::llm::{LlmClient, TokenUsage};
use crate::observability::{Tracer, metrics};
use crate::queue::MessageQueue;
use crate::registry::{AgentConfig, AgentRegistry, RegistryError};
use crate::shared_memory::{MemoryScope, SharedMemory};
use crate::workflow::event::{WorkflowEvent, WorkflowStatus};
use crate::workflow::patterns::{self, ExecutorCtx, PatternOutput};
use crate::workflow::spec::{WorkflowKind, WorkflowSpec};
use crate::workflow::WorkflowError;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Wall-clock budget applied when the spec does not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Capacity of the caller-facing event stream.
const EVENT_STREAM_CAPACITY: usize = 256;

struct WorkflowHandle {
    token: CancellationToken,
    status: Arc<RwLock<WorkflowStatus>>,
}

/// Pattern executor host.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    gate: Arc<Semaphore>,
    registry: Arc<AgentRegistry>,
    queue: Arc<MessageQueue>,
    bus: Arc<BroadcastBus>,
    memory: Arc<SharedMemory>,
    tracer: Arc<dyn Tracer>,
    breaker_threshold: u32,
    active: DashMap<WorkflowId, WorkflowHandle>,
}

impl Orchestrator {
    /// Creates an orchestrator sharing the fabric's components. The
    /// semaphore passed here is the same one the agent runtime uses, so
    /// the concurrency limit holds across both.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        gate: Arc<Semaphore>,
        registry: Arc<AgentRegistry>,
        queue: Arc<MessageQueue>,
        bus: Arc<BroadcastBus>,
        memory: Arc<SharedMemory>,
        tracer: Arc<dyn Tracer>,
        breaker_threshold: u32,
    ) -> Self {
        Self {
            llm,
            gate,
            registry,
            queue,
            bus,
            memory,
            tracer,
            breaker_threshold,
            active: DashMap::new(),
        }
    }

    /// Parses, validates, activates, and launches a workflow.
    ///
    /// Returns the workflow id plus a best-effort stream of progress
    /// events. Terminal state is always available through
    /// [`Orchestrator::get_workflow_status`] even if events are missed.
    ///
    /// # Errors
    ///
    /// Validation and unknown-agent errors surface before anything is
    /// activated or persisted.
    #[instrument(skip(self, doc, initial_input))]
    pub async fn run_workflow(
        &self,
        doc: &Value,
        initial_input: &str,
    ) -> Result<(WorkflowId, mpsc::Receiver<WorkflowEvent>), WorkflowError> {
        let spec = WorkflowSpec::parse(doc)?;
        let workflow_id = WorkflowId::generate();
        let scope = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("wf-{:.8}", workflow_id.to_string()));

        let members = self.resolve_member_configs(&spec).await?;
        // Members that already carry a workflow scope are direct
        // references, not instances to activate under this scope.
        let to_activate: Vec<(String, AgentConfig)> = members
            .into_iter()
            .filter(|(name, _)| !name.contains(':'))
            .collect();
        self.registry.activate_workflow(&scope, &to_activate).await?;

        let (internal_tx, mut internal_rx) = mpsc::channel::<WorkflowEvent>(EVENT_STREAM_CAPACITY);
        let (caller_tx, caller_rx) = mpsc::channel::<WorkflowEvent>(EVENT_STREAM_CAPACITY);

        let status = Arc::new(RwLock::new(WorkflowStatus::Running {
            stage: None,
            rounds_completed: 0,
        }));
        let token = CancellationToken::new();
        self.active.insert(
            workflow_id,
            WorkflowHandle {
                token: token.clone(),
                status: Arc::clone(&status),
            },
        );

        // Event pump: fold events into the status, then forward to the
        // caller best-effort.
        let pump_status = Arc::clone(&status);
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                pump_status.write().await.apply(&event);
                let _ = caller_tx.try_send(event);
            }
        });

        let ctx = ExecutorCtx {
            llm: Arc::clone(&self.llm),
            gate: Arc::clone(&self.gate),
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            bus: Arc::clone(&self.bus),
            memory: Arc::clone(&self.memory),
            tracer: Arc::clone(&self.tracer),
            events: internal_tx.clone(),
            token: token.clone(),
            workflow_id,
            scope: scope.clone(),
            breaker_threshold: self.breaker_threshold,
        };

        let registry = Arc::clone(&self.registry);
        let memory = Arc::clone(&self.memory);
        let tracer = Arc::clone(&self.tracer);
        let timeout = spec
            .timeout_seconds
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs);
        let timeout_seconds = timeout.as_secs();
        let input = initial_input.to_string();
        let pattern = spec.kind.pattern_name().to_string();

        ctx.emit(WorkflowEvent::Started {
            workflow_id,
            pattern: pattern.clone(),
        });
        info!(workflow_id = %workflow_id, pattern = %pattern, scope = %scope, "workflow launched");

        tokio::spawn(async move {
            let execution = Self::execute(&ctx, &spec, &input);
            let result = tokio::select! {
                () = token.cancelled() => Err(WorkflowError::Cancelled),
                outcome = tokio::time::timeout(timeout, execution) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(WorkflowError::TimedOut { timeout_seconds }),
                },
            };

            let terminal = match result {
                Ok(PatternOutput { output, usage }) => {
                    Self::record_usage(&tracer, &usage);
                    WorkflowEvent::Completed { output, usage }
                }
                Err(WorkflowError::Cancelled) => WorkflowEvent::Cancelled,
                Err(WorkflowError::TimedOut { timeout_seconds }) => {
                    warn!(workflow_id = %workflow_id, timeout_seconds, "workflow timed out");
                    WorkflowEvent::TimedOut { timeout_seconds }
                }
                Err(error) => {
                    tracer.record_error("orchestrator", &error.to_string());
                    WorkflowEvent::Failed {
                        error: error.to_string(),
                    }
                }
            };
            let _ = internal_tx.send(terminal).await;

            registry.deactivate_workflow(&scope).await;
            memory.clear_scope(MemoryScope::Workflow(workflow_id));
        });

        Ok((workflow_id, caller_rx))
    }

    /// Requests cancellation; outstanding agent tasks see it at their
    /// next suspension point and partial results are discarded.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown workflow ids.
    pub fn cancel_workflow(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        let handle = self
            .active
            .get(&id)
            .ok_or(WorkflowError::NotFound { id })?;
        handle.token.cancel();
        Ok(())
    }

    /// Current status of a workflow, live or terminal.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown workflow ids.
    pub async fn get_workflow_status(&self, id: WorkflowId) -> Result<WorkflowStatus, WorkflowError> {
        let handle = self
            .active
            .get(&id)
            .ok_or(WorkflowError::NotFound { id })?;
        let status = handle.status.read().await.clone();
        Ok(status)
    }

    async fn execute(
        ctx: &ExecutorCtx,
        spec: &WorkflowSpec,
        input: &str,
    ) -> Result<PatternOutput, WorkflowError> {
        match &spec.kind {
            WorkflowKind::Pipeline(spec) => patterns::run_pipeline(ctx, spec, input).await,
            WorkflowKind::Parallel(spec) => patterns::run_parallel(ctx, spec, input).await,
            WorkflowKind::ForkJoin(spec) => patterns::run_fork_join(ctx, spec, input).await,
            WorkflowKind::Debate(spec) => patterns::run_debate(ctx, spec, input).await,
            WorkflowKind::Conditional(spec) => patterns::run_conditional(ctx, spec, input).await,
            WorkflowKind::Swarm(spec) => patterns::run_swarm(ctx, spec, input).await,
            WorkflowKind::EventDriven(spec) => patterns::run_event_driven(ctx, spec, input).await,
        }
    }

    async fn resolve_member_configs(
        &self,
        spec: &WorkflowSpec,
    ) -> Result<Vec<(String, AgentConfig)>, WorkflowError> {
        let mut members = Vec::new();
        for member in spec.members() {
            // The event-driven form may declare configs inline.
            let inline = match &spec.kind {
                WorkflowKind::EventDriven(event_spec) => event_spec
                    .agents
                    .iter()
                    .find(|entry| entry.id == member)
                    .and_then(|entry| entry.config.clone()),
                _ => None,
            };
            let config = match inline {
                Some(config) => config,
                None => {
                    let bare = AgentId::try_new(member.clone()).map_err(|_| {
                        WorkflowError::UnknownAgent { id: member.clone() }
                    })?;
                    match self.registry.lookup(&bare).await {
                        Ok(config) => config,
                        Err(RegistryError::NotFound { .. }) => {
                            return Err(WorkflowError::UnknownAgent { id: member });
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            members.push((member, config));
        }
        Ok(members)
    }

    fn record_usage(tracer: &Arc<dyn Tracer>, usage: &TokenUsage) {
        tracer.record_metric(metrics::LLM_PROMPT_TOKENS, usage.prompt_tokens as f64);
        tracer.record_metric(
            metrics::LLM_COMPLETION_TOKENS,
            usage.completion_tokens as f64,
        );
        tracer.record_metric(metrics::LLM_COST_USD, usage.cost.to_f64().unwrap_or(0.0));
    }
}
