//! Pattern executors.
//!
//! Each executor takes the shared [`ExecutorCtx`] plus its validated spec
//! and drives the member agents to a single output. Model calls go
//! through [`ExecutorCtx::invoke`], which holds a permit of the global
//! LLM semaphore for the duration of the call; parallel fan-outs push
//! their results through a channel and the merge stage runs only after
//! every task has reported.

use crate::agent::AgentRuntime;
use crate::broadcast::BroadcastBus;
use crate::domain_types::{AgentId, TopicName, WorkflowId};
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage,
};
use crate::observability::{Tracer, metrics};
use crate::queue::MessageQueue;
use crate::registry::{AgentConfig, AgentRegistry, RegistryError};
use crate::shared_memory::SharedMemory;
use crate::workflow::WorkflowError;
use crate::workflow::event::WorkflowEvent;
use crate::workflow::spec::{
    CommunicationMode, ConditionalSpec, DebateSpec, EventDrivenSpec, ForkJoinSpec, MergeStrategy,
    ParallelSpec, PipelineSpec, SwarmSpec, SwarmStrategy,
};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The one output every pattern reduces to.
#[derive(Debug, Clone)]
pub struct PatternOutput {
    /// Final text of the run.
    pub output: String,
    /// Aggregate token accounting across every model call.
    pub usage: TokenUsage,
}

/// Shared dependencies handed to every executor.
#[derive(Clone)]
pub(crate) struct ExecutorCtx {
    pub llm: Arc<dyn LlmClient>,
    pub gate: Arc<Semaphore>,
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<MessageQueue>,
    pub bus: Arc<BroadcastBus>,
    pub memory: Arc<SharedMemory>,
    pub tracer: Arc<dyn Tracer>,
    pub events: mpsc::Sender<WorkflowEvent>,
    pub token: CancellationToken,
    #[allow(dead_code)]
    pub workflow_id: WorkflowId,
    /// Workflow scope prefix for composite member ids.
    pub scope: String,
    /// Consecutive output-token-limit failures that trip the breaker.
    pub breaker_threshold: u32,
}

impl ExecutorCtx {
    /// Emits a progress event, dropping it if the stream is saturated.
    pub(crate) fn emit(&self, event: WorkflowEvent) {
        let _ = self.events.try_send(event);
    }

    /// Fails fast once cancellation has been requested.
    pub(crate) fn ensure_live(&self) -> Result<(), WorkflowError> {
        if self.token.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Resolves a member name to its workflow-scoped agent, falling back
    /// to the bare id for standing agents.
    pub(crate) async fn resolve(
        &self,
        member: &str,
    ) -> Result<(AgentId, AgentConfig), WorkflowError> {
        if let Ok(scoped) = AgentId::composite(&self.scope, member) {
            if let Ok(config) = self.registry.lookup(&scoped).await {
                return Ok((scoped, config));
            }
        }
        let bare = AgentId::try_new(member.to_string()).map_err(|_| {
            WorkflowError::UnknownAgent {
                id: member.to_string(),
            }
        })?;
        match self.registry.lookup(&bare).await {
            Ok(config) => Ok((bare, config)),
            Err(RegistryError::NotFound { .. }) => Err(WorkflowError::UnknownAgent {
                id: member.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs one model call under the global concurrency gate.
    pub(crate) async fn invoke(
        &self,
        config: &AgentConfig,
        prompt: &str,
    ) -> Result<CompletionResponse, LlmError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| LlmError::Provider {
                message: "llm concurrency gate closed".to_string(),
            })?;
        let request = CompletionRequest::new(vec![
            ChatMessage::system(config.system_prompt.clone()),
            ChatMessage::user(prompt.to_string()),
        ])
        .with_model(config.model.clone());
        self.llm.complete(request).await
    }
}

/// Counts consecutive output-token-limit failures within one stage.
pub(crate) struct StageBreaker {
    stage: String,
    threshold: u32,
    consecutive: u32,
}

impl StageBreaker {
    pub(crate) fn new(stage: &str, threshold: u32) -> Self {
        Self {
            stage: stage.to_string(),
            threshold,
            consecutive: 0,
        }
    }

    /// Records a failure; trips into `CircuitOpen` when the run of
    /// output-token-limit failures reaches the threshold.
    pub(crate) fn observe_failure(&mut self, error: &LlmError) -> Option<WorkflowError> {
        if matches!(error, LlmError::OutputTokenLimit { .. }) {
            self.consecutive += 1;
            if self.consecutive >= self.threshold {
                return Some(WorkflowError::CircuitOpen {
                    stage: self.stage.clone(),
                    failures: self.consecutive,
                });
            }
        } else {
            self.consecutive = 0;
        }
        None
    }

    pub(crate) fn observe_success(&mut self) {
        self.consecutive = 0;
    }
}

fn record_stage_duration(ctx: &ExecutorCtx, started: Instant) {
    ctx.tracer.record_metric(
        metrics::STAGE_DURATION_MS,
        started.elapsed().as_millis() as f64,
    );
}

/// Pipeline: each stage receives the previous stage's output.
pub(crate) async fn run_pipeline(
    ctx: &ExecutorCtx,
    spec: &PipelineSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    let initial_prompt = spec.initial_prompt.as_deref().unwrap_or_default();
    let mut current = if input.is_empty() {
        initial_prompt.to_string()
    } else {
        format!("{initial_prompt}\n\n{input}")
    };
    let mut usage = TokenUsage::zero();
    let mut history: Vec<(String, String)> = Vec::new();

    for (index, stage) in spec.stages.iter().enumerate() {
        ctx.ensure_live()?;
        let (agent_id, config) = ctx.resolve(&stage.agent).await?;
        ctx.emit(WorkflowEvent::StageStarted {
            stage: index,
            agent: agent_id.clone(),
        });
        let started = Instant::now();

        let mut prompt = String::new();
        if spec.shared_context && !history.is_empty() {
            prompt.push_str("Previous stages:\n");
            for (member, output) in &history {
                prompt.push_str(&format!("[{member}]\n{output}\n\n"));
            }
        }
        if let Some(stage_prompt) = &stage.prompt {
            prompt.push_str(stage_prompt);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&current);

        // Output-token-limit failures are retried within the stage until
        // the breaker trips; other failures fail the stage immediately.
        let mut breaker = StageBreaker::new(&format!("stage {index}"), ctx.breaker_threshold);
        let attempt = loop {
            match ctx.invoke(&config, &prompt).await {
                Ok(response) => break Ok(response),
                Err(error) => {
                    if let Some(tripped) = breaker.observe_failure(&error) {
                        ctx.tracer.record_error("orchestrator", &tripped.to_string());
                        return Err(tripped);
                    }
                    if matches!(error, LlmError::OutputTokenLimit { .. }) {
                        warn!(stage = index, error = %error, "retrying stage after token-limit failure");
                        continue;
                    }
                    break Err(error);
                }
            }
        };

        match attempt {
            Ok(response) => {
                breaker.observe_success();
                usage.absorb(&response.usage);
                ctx.emit(WorkflowEvent::AgentCompleted {
                    agent: agent_id,
                    output: response.content.clone(),
                    usage: response.usage.clone(),
                });
                history.push((stage.agent.clone(), response.content.clone()));
                current = response.content;
            }
            Err(error) => {
                ctx.emit(WorkflowEvent::AgentFailed {
                    agent: agent_id.clone(),
                    error: error.to_string(),
                });
                if !spec.continue_on_error {
                    return Err(WorkflowError::AgentFailed {
                        agent: agent_id,
                        message: error.to_string(),
                    });
                }
                warn!(stage = index, agent = %agent_id, error = %error,
                      "stage failed; continuing with previous output");
            }
        }
        record_stage_duration(ctx, started);
    }

    Ok(PatternOutput {
        output: current,
        usage,
    })
}

struct FanoutResult {
    index: usize,
    member: String,
    agent: AgentId,
    outcome: Result<CompletionResponse, LlmError>,
}

/// Launches one task per member; each acquires the semaphore inside
/// `invoke`, runs its call, and pushes into the results channel. Returns
/// results ordered by launch index.
async fn fan_out(
    ctx: &ExecutorCtx,
    members: Vec<(String, String)>,
) -> Result<Vec<FanoutResult>, WorkflowError> {
    let expected = members.len();
    let (results_tx, mut results_rx) = mpsc::channel::<FanoutResult>(expected.max(1));

    for (index, (member, prompt)) in members.into_iter().enumerate() {
        let (agent_id, config) = ctx.resolve(&member).await?;
        let task_ctx = ctx.clone();
        let results = results_tx.clone();
        tokio::spawn(async move {
            let outcome = task_ctx.invoke(&config, &prompt).await;
            let _ = results
                .send(FanoutResult {
                    index,
                    member,
                    agent: agent_id,
                    outcome,
                })
                .await;
        });
    }
    drop(results_tx);

    let mut collected = Vec::with_capacity(expected);
    while let Some(result) = results_rx.recv().await {
        match &result.outcome {
            Ok(response) => ctx.emit(WorkflowEvent::AgentCompleted {
                agent: result.agent.clone(),
                output: response.content.clone(),
                usage: response.usage.clone(),
            }),
            Err(error) => ctx.emit(WorkflowEvent::AgentFailed {
                agent: result.agent.clone(),
                error: error.to_string(),
            }),
        }
        collected.push(result);
    }
    collected.sort_by_key(|result| result.index);
    Ok(collected)
}

fn normalize_answer(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!', '?'])
        .to_lowercase()
}

async fn merge_outputs(
    ctx: &ExecutorCtx,
    strategy: MergeStrategy,
    merge_agent: Option<&str>,
    outputs: &[(String, String)],
    usage: &mut TokenUsage,
) -> Result<String, WorkflowError> {
    let merged = match strategy {
        MergeStrategy::Concatenate => outputs
            .iter()
            .map(|(member, output)| format!("### {member}\n{output}"))
            .collect::<Vec<_>>()
            .join("\n\n"),
        MergeStrategy::Vote => {
            // (answer, count, first-seen index); ties resolve to the
            // earliest answer.
            let mut tallies: Vec<(String, usize, usize)> = Vec::new();
            for (index, (_, output)) in outputs.iter().enumerate() {
                let answer = normalize_answer(output);
                if let Some(entry) = tallies.iter_mut().find(|(seen, _, _)| *seen == answer) {
                    entry.1 += 1;
                } else {
                    tallies.push((answer, 1, index));
                }
            }
            tallies.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
            tallies
                .into_iter()
                .next()
                .map(|(answer, _, _)| answer)
                .unwrap_or_default()
        }
        MergeStrategy::Summarize => {
            let member = merge_agent
                .or_else(|| outputs.first().map(|(member, _)| member.as_str()))
                .unwrap_or_default();
            let (merge_id, config) = ctx.resolve(member).await?;
            let combined = outputs
                .iter()
                .map(|(member, output)| format!("[{member}]\n{output}"))
                .collect::<Vec<_>>()
                .join("\n\n");
            let prompt =
                format!("Synthesize these responses into one coherent answer:\n\n{combined}");
            let response =
                ctx.invoke(&config, &prompt)
                    .await
                    .map_err(|e| WorkflowError::AgentFailed {
                        agent: merge_id,
                        message: e.to_string(),
                    })?;
            usage.absorb(&response.usage);
            response.content
        }
    };

    ctx.emit(WorkflowEvent::MergeCompleted {
        strategy: format!("{strategy:?}").to_lowercase(),
        output: merged.clone(),
    });
    Ok(merged)
}

/// Parallel: same prompt to every agent, all must succeed.
pub(crate) async fn run_parallel(
    ctx: &ExecutorCtx,
    spec: &ParallelSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    ctx.ensure_live()?;
    let members: Vec<(String, String)> = spec
        .agents
        .iter()
        .map(|entry| {
            let base = entry
                .prompt
                .as_deref()
                .or_else(|| spec.prompt.as_deref())
                .unwrap_or_default();
            let prompt = if input.is_empty() {
                base.to_string()
            } else {
                format!("{base}\n\n{input}")
            };
            (entry.agent.clone(), prompt)
        })
        .collect();

    let results = fan_out(ctx, members).await?;

    let mut usage = TokenUsage::zero();
    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        match result.outcome {
            Ok(response) => {
                usage.absorb(&response.usage);
                outputs.push((result.member, response.content));
            }
            Err(error) => {
                return Err(WorkflowError::AgentFailed {
                    agent: result.agent,
                    message: error.to_string(),
                });
            }
        }
    }

    let strategy = spec.merge_strategy.unwrap_or(MergeStrategy::Concatenate);
    let output = merge_outputs(ctx, strategy, None, &outputs, &mut usage).await?;
    Ok(PatternOutput { output, usage })
}

/// Fork-join: parallel fan-out, tolerating failures down to
/// `min_successes`, then an explicit merge stage.
pub(crate) async fn run_fork_join(
    ctx: &ExecutorCtx,
    spec: &ForkJoinSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    ctx.ensure_live()?;
    let prompt = spec.prompt.as_deref().unwrap_or_default();
    let members: Vec<(String, String)> = spec
        .agent_ids
        .iter()
        .map(|member| {
            let full = if input.is_empty() {
                prompt.to_string()
            } else {
                format!("{prompt}\n\n{input}")
            };
            (member.clone(), full)
        })
        .collect();

    let required = spec.min_successes.unwrap_or(spec.agent_ids.len());
    let results = fan_out(ctx, members).await?;

    let mut usage = TokenUsage::zero();
    let mut outputs = Vec::new();
    for result in results {
        match result.outcome {
            Ok(response) => {
                usage.absorb(&response.usage);
                outputs.push((result.member, response.content));
            }
            Err(error) => {
                debug!(agent = %result.agent, error = %error, "fork-join branch failed");
            }
        }
    }

    if outputs.len() < required {
        return Err(WorkflowError::InsufficientSuccesses {
            required,
            succeeded: outputs.len(),
        });
    }

    let strategy = spec
        .merge_strategy
        .expect("merge_strategy verified during validation");
    let output = merge_outputs(
        ctx,
        strategy,
        spec.merge_agent.as_deref(),
        &outputs,
        &mut usage,
    )
    .await?;
    Ok(PatternOutput { output, usage })
}

/// Debate: N rounds of alternating responses, optional moderator
/// synthesis.
pub(crate) async fn run_debate(
    ctx: &ExecutorCtx,
    spec: &DebateSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    let topic = spec.topic.as_deref().unwrap_or_default();
    let rounds = spec.rounds.unwrap_or(1);
    let mut usage = TokenUsage::zero();
    let mut transcript: Vec<(String, String)> = Vec::new();
    let mut breaker = StageBreaker::new("debate", ctx.breaker_threshold);

    for round in 1..=rounds {
        for member in &spec.agent_ids {
            ctx.ensure_live()?;
            let (agent_id, config) = ctx.resolve(member).await?;

            let mut prompt = format!("Debate topic: {topic}\n");
            if !input.is_empty() && round == 1 && transcript.is_empty() {
                prompt.push_str(&format!("Context: {input}\n"));
            }
            if !transcript.is_empty() {
                prompt.push_str("\nDiscussion so far:\n");
                for (speaker, text) in &transcript {
                    prompt.push_str(&format!("{speaker}: {text}\n"));
                }
            }
            prompt.push_str(&format!(
                "\nRound {round}: give your position, addressing the strongest prior argument."
            ));

            match ctx.invoke(&config, &prompt).await {
                Ok(response) => {
                    breaker.observe_success();
                    usage.absorb(&response.usage);
                    ctx.emit(WorkflowEvent::AgentCompleted {
                        agent: agent_id,
                        output: response.content.clone(),
                        usage: response.usage.clone(),
                    });
                    transcript.push((config.display_name.clone(), response.content));
                }
                Err(error) => {
                    if let Some(tripped) = breaker.observe_failure(&error) {
                        ctx.tracer.record_error("orchestrator", &tripped.to_string());
                        return Err(tripped);
                    }
                    return Err(WorkflowError::AgentFailed {
                        agent: agent_id,
                        message: error.to_string(),
                    });
                }
            }
        }
        ctx.emit(WorkflowEvent::RoundCompleted { round });
    }

    let output = if let Some(moderator) = &spec.moderator {
        ctx.ensure_live()?;
        let (agent_id, config) = ctx.resolve(moderator).await?;
        let discussion = transcript
            .iter()
            .map(|(speaker, text)| format!("{speaker}: {text}"))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Debate topic: {topic}\n\nFull discussion:\n{discussion}\n\nSynthesize the debate into a final answer."
        );
        let response = ctx
            .invoke(&config, &prompt)
            .await
            .map_err(|e| WorkflowError::AgentFailed {
                agent: agent_id,
                message: e.to_string(),
            })?;
        usage.absorb(&response.usage);
        response.content
    } else {
        transcript
            .iter()
            .map(|(speaker, text)| format!("{speaker}: {text}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    Ok(PatternOutput { output, usage })
}

fn normalize_label(text: &str) -> String {
    text.trim()
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(['"', '\'', '.', ',', ':', ';', '!'])
        .to_lowercase()
}

/// Conditional: a classifier label selects the branch agent.
pub(crate) async fn run_conditional(
    ctx: &ExecutorCtx,
    spec: &ConditionalSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    ctx.ensure_live()?;
    let classifier = spec.classifier.as_deref().unwrap_or_default();
    let (classifier_id, classifier_config) = ctx.resolve(classifier).await?;

    let labels = spec.branches.keys().cloned().collect::<Vec<_>>().join(", ");
    let prompt = format!("{input}\n\nClassify this input. Respond with exactly one label from: {labels}");

    let mut usage = TokenUsage::zero();
    let classification =
        ctx.invoke(&classifier_config, &prompt)
            .await
            .map_err(|e| WorkflowError::AgentFailed {
                agent: classifier_id,
                message: e.to_string(),
            })?;
    usage.absorb(&classification.usage);

    let label = normalize_label(&classification.content);
    let branch = spec
        .branches
        .iter()
        .find(|(candidate, _)| candidate.to_lowercase() == label)
        .map(|(_, member)| member.clone())
        .or_else(|| spec.default_branch.clone())
        .ok_or_else(|| WorkflowError::UnknownBranch {
            label: label.clone(),
        })?;

    debug!(label = %label, branch = %branch, "classifier selected branch");
    ctx.ensure_live()?;
    let (branch_id, branch_config) = ctx.resolve(&branch).await?;
    ctx.emit(WorkflowEvent::StageStarted {
        stage: 1,
        agent: branch_id.clone(),
    });
    let response = ctx
        .invoke(&branch_config, input)
        .await
        .map_err(|e| WorkflowError::AgentFailed {
            agent: branch_id.clone(),
            message: e.to_string(),
        })?;
    usage.absorb(&response.usage);
    ctx.emit(WorkflowEvent::AgentCompleted {
        agent: branch_id,
        output: response.content.clone(),
        usage: response.usage.clone(),
    });

    Ok(PatternOutput {
        output: response.content,
        usage,
    })
}

fn parse_verdict(content: &str) -> (String, f32) {
    if let Ok(value) = serde_json::from_str::<Value>(content.trim()) {
        if let Some(verdict) = value.get("verdict").and_then(Value::as_str) {
            let confidence = value
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(1.0);
            #[allow(clippy::cast_possible_truncation)]
            return (normalize_answer(verdict), confidence as f32);
        }
    }
    let first_word = content
        .split_whitespace()
        .next()
        .unwrap_or_default();
    (normalize_answer(first_word), 1.0)
}

fn winning_verdict(
    counts: &HashMap<String, usize>,
    total: usize,
    strategy: SwarmStrategy,
) -> Option<String> {
    let (top_verdict, top_count) = counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(verdict, count)| (verdict.clone(), *count))?;

    let wins = match strategy {
        SwarmStrategy::Majority => top_count * 2 > total,
        SwarmStrategy::Supermajority => top_count * 3 >= total * 2,
        SwarmStrategy::Unanimous => top_count == total && total > 0,
    };
    wins.then_some(top_verdict)
}

/// Swarm: voters emit verdicts, aggregation decides, optional judge
/// breaks ties.
pub(crate) async fn run_swarm(
    ctx: &ExecutorCtx,
    spec: &SwarmSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    ctx.ensure_live()?;
    let strategy = spec.strategy.expect("strategy verified during validation");
    let base = spec.prompt.as_deref().unwrap_or_default();
    let prompt = format!(
        "{base}\n\n{input}\n\nAnswer as JSON: {{\"verdict\": \"<verdict>\", \"confidence\": <0.0-1.0>}}"
    );

    let members: Vec<(String, String)> = spec
        .agent_ids
        .iter()
        .map(|member| (member.clone(), prompt.clone()))
        .collect();
    let results = fan_out(ctx, members).await?;

    let mut usage = TokenUsage::zero();
    let mut votes: Vec<(String, String, f32)> = Vec::new();
    for result in results {
        match result.outcome {
            Ok(response) => {
                usage.absorb(&response.usage);
                let (verdict, confidence) = parse_verdict(&response.content);
                votes.push((result.member, verdict, confidence));
            }
            Err(error) => {
                debug!(agent = %result.agent, error = %error, "swarm voter failed");
            }
        }
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut counted = 0usize;
    for (_, verdict, confidence) in &votes {
        if *confidence >= spec.confidence_threshold && !verdict.is_empty() {
            *counts.entry(verdict.clone()).or_insert(0) += 1;
            counted += 1;
        }
    }

    if let Some(verdict) = winning_verdict(&counts, counted, strategy) {
        ctx.emit(WorkflowEvent::MergeCompleted {
            strategy: format!("{strategy:?}").to_lowercase(),
            output: verdict.clone(),
        });
        return Ok(PatternOutput {
            output: verdict,
            usage,
        });
    }

    if let Some(judge) = &spec.judge {
        ctx.ensure_live()?;
        let (judge_id, judge_config) = ctx.resolve(judge).await?;
        let ballots = votes
            .iter()
            .map(|(member, verdict, confidence)| {
                format!("{member}: {verdict} (confidence {confidence:.2})")
            })
            .collect::<Vec<_>>()
            .join("\n");
        let judge_prompt = format!(
            "{input}\n\nThe voters were split:\n{ballots}\n\nDecide the final verdict. Respond with the verdict only."
        );
        let response =
            ctx.invoke(&judge_config, &judge_prompt)
                .await
                .map_err(|e| WorkflowError::AgentFailed {
                    agent: judge_id,
                    message: e.to_string(),
                })?;
        usage.absorb(&response.usage);
        let verdict = normalize_answer(&response.content);
        return Ok(PatternOutput {
            output: verdict,
            usage,
        });
    }

    Err(WorkflowError::Inconclusive {
        strategy: format!("{strategy:?}").to_lowercase(),
    })
}

/// Event-driven form: members communicate through the queue and the
/// broadcast bus instead of a fixed control flow.
pub(crate) async fn run_event_driven(
    ctx: &ExecutorCtx,
    spec: &EventDrivenSpec,
    input: &str,
) -> Result<PatternOutput, WorkflowError> {
    let entrypoint = spec.entrypoint.as_deref().unwrap_or_default();
    let communication = spec.communication.clone().unwrap_or_default();

    let mut topics = Vec::new();
    if communication.topics.is_empty() {
        let default = format!("{}.events", ctx.scope);
        topics.push(TopicName::try_new(default).map_err(|e| WorkflowError::Validation {
            field: "communication.topics".to_string(),
            reason: e.to_string(),
        })?);
    } else {
        for topic in &communication.topics {
            topics.push(TopicName::try_new(topic.clone()).map_err(|e| {
                WorkflowError::Validation {
                    field: "communication.topics".to_string(),
                    reason: e.to_string(),
                }
            })?);
        }
    }

    // Build one hosted runtime per member; topic subscriptions depend on
    // the communication mode.
    let mut hub: Option<Arc<AgentRuntime>> = None;
    let mut spokes: Vec<Arc<AgentRuntime>> = Vec::new();
    for member in &spec.agents {
        let (agent_id, mut config) = ctx.resolve(&member.id).await?;
        let is_hub = member.id == entrypoint;
        config.topics = match communication.mode {
            CommunicationMode::HubAndSpoke if is_hub => Vec::new(),
            _ => topics.clone(),
        };
        let runtime = AgentRuntime::new(
            agent_id,
            config,
            Arc::clone(&ctx.llm),
            Arc::clone(&ctx.queue),
            Arc::clone(&ctx.bus),
            Arc::clone(&ctx.memory),
            Arc::clone(&ctx.gate),
            Arc::clone(&ctx.tracer),
        );
        if is_hub {
            hub = Some(runtime);
        } else {
            spokes.push(runtime);
        }
    }
    let hub = hub.ok_or_else(|| WorkflowError::UnknownAgent {
        id: entrypoint.to_string(),
    })?;

    // Seed the entrypoint with the initial input.
    let seed_sender = AgentId::try_new(ctx.scope.clone()).map_err(|_| {
        WorkflowError::Validation {
            field: "name".to_string(),
            reason: "workflow scope is not a valid sender id".to_string(),
        }
    })?;
    ctx.queue
        .enqueue(hub.id(), Bytes::from(input.to_string()), &seed_sender)
        .await
        .map_err(|e| WorkflowError::AgentFailed {
            agent: hub.id().clone(),
            message: e.to_string(),
        })?;

    let mut usage = TokenUsage::zero();
    let mut final_output = String::new();

    for round in 1..=spec.max_rounds {
        ctx.ensure_live()?;
        let mut quiescent = true;

        let hub_outcome = hub.tick().await.map_err(|e| WorkflowError::AgentFailed {
            agent: hub.id().clone(),
            message: e.to_string(),
        })?;
        usage.absorb(&hub_outcome.usage);
        if let Some(reply) = hub_outcome.reply {
            quiescent = false;
            ctx.emit(WorkflowEvent::AgentCompleted {
                agent: hub.id().clone(),
                output: reply.clone(),
                usage: hub_outcome.usage.clone(),
            });
            for topic in &topics {
                ctx.bus
                    .publish(topic, hub.id(), Bytes::from(reply.clone()));
            }
            final_output = reply;
        }

        for spoke in &spokes {
            ctx.ensure_live()?;
            let outcome = spoke.tick().await.map_err(|e| WorkflowError::AgentFailed {
                agent: spoke.id().clone(),
                message: e.to_string(),
            })?;
            usage.absorb(&outcome.usage);
            if let Some(reply) = outcome.reply {
                quiescent = false;
                ctx.emit(WorkflowEvent::AgentCompleted {
                    agent: spoke.id().clone(),
                    output: reply.clone(),
                    usage: outcome.usage.clone(),
                });
                match communication.mode {
                    CommunicationMode::HubAndSpoke => {
                        ctx.queue
                            .enqueue(hub.id(), Bytes::from(reply), spoke.id())
                            .await
                            .map_err(|e| WorkflowError::AgentFailed {
                                agent: spoke.id().clone(),
                                message: e.to_string(),
                            })?;
                    }
                    CommunicationMode::PeerPubSub => {
                        for topic in &topics {
                            ctx.bus.publish(topic, spoke.id(), Bytes::from(reply.clone()));
                        }
                    }
                }
            }
        }

        ctx.emit(WorkflowEvent::RoundCompleted { round });
        if quiescent {
            break;
        }
    }

    for runtime in spokes.iter().chain(std::iter::once(&hub)) {
        for topic in &topics {
            ctx.bus.unsubscribe(runtime.id(), topic);
        }
    }

    Ok(PatternOutput {
        output: final_output,
        usage,
    })
}
