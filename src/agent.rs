//! Conversation loop hosting one agent instance.
//!
//! Each tick the runtime drains pending queue messages and broadcast
//! events, injects them as conversational input, invokes the LLM under
//! the global concurrency gate, executes requested tool calls, and only
//! then acknowledges the messages whose reply was produced. Failures
//! leave messages in flight so the visibility timeout redelivers them.

use crate::broadcast::BroadcastBus;
use crate::context::RunContext;
use crate::domain_types::{AgentId, MessageId, SessionId};
use crate::interrupt::{Interrupt, InterruptHandler};
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
use crate::observability::{Tracer, metrics};
use crate::queue::{MessageQueue, QueueError};
use crate::registry::AgentConfig;
use crate::shared_memory::{MemoryScope, SharedMemory};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

/// How long an idle agent sleeps between polls.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Agent runtime errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// LLM invocation failed; undelivered inputs stay in flight.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Queue interaction failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A tool the model requested failed.
    #[error("tool '{name}' failed: {message}")]
    Tool { name: String, message: String },

    /// The model requested a tool that is not registered.
    #[error("unknown tool '{name}' requested")]
    UnknownTool { name: String },
}

/// A tool callable by the hosted agent.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registered name the model refers to.
    fn name(&self) -> &str;

    /// Executes the tool with provider-parsed arguments.
    async fn invoke(&self, arguments: Value) -> Result<String, String>;
}

/// Outcome of one conversation tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// The reply produced, or `None` when there was no input.
    pub reply: Option<String>,
    /// Messages acknowledged this tick.
    pub acknowledged: Vec<MessageId>,
    /// Token accounting for the tick's LLM calls.
    pub usage: TokenUsage,
}

/// Hosts the conversation loop for one agent instance.
pub struct AgentRuntime {
    id: AgentId,
    config: AgentConfig,
    session_id: SessionId,
    llm: Arc<dyn LlmClient>,
    queue: Arc<MessageQueue>,
    bus: Arc<BroadcastBus>,
    memory: Arc<SharedMemory>,
    llm_gate: Arc<Semaphore>,
    tracer: Arc<dyn Tracer>,
    tools: HashMap<String, Arc<dyn Tool>>,
    history: Mutex<Vec<ChatMessage>>,
    pending_interrupts: std::sync::Mutex<Vec<Interrupt>>,
}

impl AgentRuntime {
    /// Creates a runtime for one agent and subscribes it to its
    /// configured topics.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: AgentId,
        config: AgentConfig,
        llm: Arc<dyn LlmClient>,
        queue: Arc<MessageQueue>,
        bus: Arc<BroadcastBus>,
        memory: Arc<SharedMemory>,
        llm_gate: Arc<Semaphore>,
        tracer: Arc<dyn Tracer>,
    ) -> Arc<Self> {
        for topic in &config.topics {
            bus.subscribe(&id, topic);
        }
        let history = vec![ChatMessage::system(config.system_prompt.clone())];
        Arc::new(Self {
            id,
            config,
            session_id: SessionId::generate(),
            llm,
            queue,
            bus,
            memory,
            llm_gate,
            tracer,
            tools: HashMap::new(),
            history: Mutex::new(history),
            pending_interrupts: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Registers a tool before the loop starts.
    ///
    /// # Panics
    ///
    /// Panics when called on a runtime that is already shared, since
    /// tools are fixed at construction time.
    #[must_use]
    pub fn with_tool(mut runtime: Arc<Self>, tool: Arc<dyn Tool>) -> Arc<Self> {
        let inner = Arc::get_mut(&mut runtime).expect("tools must be registered before sharing");
        inner.tools.insert(tool.name().to_string(), tool);
        runtime
    }

    /// This agent's id.
    #[must_use]
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// The session identifier keying shared memory and telemetry.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The session-scoped view of shared memory.
    #[must_use]
    pub fn session_memory(&self) -> MemoryScope {
        MemoryScope::Session(self.session_id)
    }

    /// An interrupt handler that feeds signals into the next tick as
    /// conversational input.
    #[must_use]
    pub fn interrupt_sink(self: &Arc<Self>) -> Arc<dyn InterruptHandler> {
        Arc::new(InterruptSink {
            runtime: Arc::clone(self),
        })
    }

    /// Runs one tick: drain inputs, complete, run tools, acknowledge.
    ///
    /// # Errors
    ///
    /// LLM and tool failures surface here; drained messages are then left
    /// in flight and redelivered after the visibility timeout.
    #[instrument(skip(self), fields(agent_id = %self.id))]
    pub async fn tick(&self) -> Result<TickOutcome, AgentError> {
        let mut injected = Vec::new();
        let mut to_acknowledge = Vec::new();

        for interrupt in self.drain_interrupts() {
            injected.push(ChatMessage::user(format!(
                "[signal:{} from:{}]\n{}",
                interrupt.signal,
                interrupt.sender,
                String::from_utf8_lossy(&interrupt.payload)
            )));
        }

        while let Some(message) = self.queue.dequeue(&self.id).await? {
            injected.push(ChatMessage::user(format!(
                "[from:{}]\n{}",
                message.sender,
                String::from_utf8_lossy(&message.payload)
            )));
            to_acknowledge.push(message.id);
        }

        for event in self.bus.poll(&self.id) {
            injected.push(ChatMessage::user(format!(
                "[topic:{} from:{}]\n{}",
                event.topic,
                event.publisher,
                String::from_utf8_lossy(&event.payload)
            )));
        }

        if injected.is_empty() {
            return Ok(TickOutcome {
                reply: None,
                acknowledged: Vec::new(),
                usage: TokenUsage::zero(),
            });
        }

        let mut usage = TokenUsage::zero();
        let response = {
            let mut history = self.history.lock().await;
            history.extend(injected);
            let mut response = self.complete(history.clone()).await?;
            usage.absorb(&response.usage);

            // One tool round: execute requested calls, then ask the model
            // to fold the results into a final answer.
            if !response.tool_calls.is_empty() {
                history.push(ChatMessage::assistant(response.content.clone()));
                for call in &response.tool_calls {
                    let result = self.run_tool(call.name.as_str(), call.arguments.clone()).await?;
                    history.push(ChatMessage::tool(result));
                }
                response = self.complete(history.clone()).await?;
                usage.absorb(&response.usage);
            }

            history.push(ChatMessage::assistant(response.content.clone()));
            response
        };

        for id in &to_acknowledge {
            self.queue.acknowledge(*id).await?;
        }

        self.memory.write(
            self.session_memory(),
            "last_reply",
            bytes::Bytes::from(response.content.clone()),
        );
        self.record_usage(&usage);
        debug!(agent_id = %self.id, acked = to_acknowledge.len(), "tick produced a reply");
        Ok(TickOutcome {
            reply: Some(response.content),
            acknowledged: to_acknowledge,
            usage,
        })
    }

    /// Runs the conversation loop until the context is cancelled.
    pub async fn run(&self, ctx: &RunContext) {
        while !ctx.is_cancelled() {
            match self.tick().await {
                Ok(outcome) if outcome.reply.is_some() => {}
                Ok(_) => {
                    tokio::select! {
                        () = tokio::time::sleep(IDLE_POLL) => {}
                        () = ctx.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!(agent_id = %self.id, error = %e, "tick failed; inputs stay in flight");
                    tokio::select! {
                        () = tokio::time::sleep(IDLE_POLL) => {}
                        () = ctx.cancelled() => break,
                    }
                }
            }
        }
        debug!(agent_id = %self.id, "conversation loop stopped");
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<CompletionResponse, AgentError> {
        let _permit = self
            .llm_gate
            .acquire()
            .await
            .expect("llm semaphore is never closed");
        let request = CompletionRequest::new(messages).with_model(self.config.model.clone());
        Ok(self.llm.complete(request).await?)
    }

    async fn run_tool(&self, name: &str, arguments: Value) -> Result<String, AgentError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::UnknownTool {
                name: name.to_string(),
            })?;
        tool.invoke(arguments).await.map_err(|message| {
            self.tracer.record_error("agent_runtime", &message);
            AgentError::Tool {
                name: name.to_string(),
                message,
            }
        })
    }

    fn drain_interrupts(&self) -> Vec<Interrupt> {
        std::mem::take(
            &mut *self
                .pending_interrupts
                .lock()
                .expect("interrupt buffer lock poisoned"),
        )
    }

    fn record_usage(&self, usage: &TokenUsage) {
        self.tracer.record_metric(
            metrics::LLM_PROMPT_TOKENS,
            usage.prompt_tokens as f64,
        );
        self.tracer.record_metric(
            metrics::LLM_COMPLETION_TOKENS,
            usage.completion_tokens as f64,
        );
        self.tracer
            .record_metric(metrics::LLM_COST_USD, usage.cost.to_f64().unwrap_or(0.0));
    }
}

struct InterruptSink {
    runtime: Arc<AgentRuntime>,
}

#[async_trait]
impl InterruptHandler for InterruptSink {
    async fn handle(&self, interrupt: Interrupt) {
        self.runtime
            .pending_interrupts
            .lock()
            .expect("interrupt buffer lock poisoned")
            .push(interrupt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::domain_types::{InboxLimit, PoisonThreshold, VisibilityTimeoutSecs};
    use crate::llm::{ScriptedClient, ToolCall};
    use crate::observability::NoopTracer;
    use crate::registry::AgentRegistry;
    use crate::store::SqliteMessageStore;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn agent_id(id: &str) -> AgentId {
        AgentId::try_new(id.to_string()).unwrap()
    }

    async fn queue_in(dir: &TempDir) -> Arc<MessageQueue> {
        let path = DatabasePath::new(dir.path().join("agent.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
            .await
            .unwrap();
        Arc::new(MessageQueue::new(
            Arc::new(SqliteMessageStore::new(connection)),
            Arc::new(AgentRegistry::new()),
            Arc::new(NoopTracer),
            VisibilityTimeoutSecs::try_new(30).unwrap(),
            InboxLimit::try_new(100).unwrap(),
            PoisonThreshold::try_new(5).unwrap(),
        ))
    }

    fn runtime_with(
        queue: Arc<MessageQueue>,
        llm: Arc<dyn LlmClient>,
    ) -> Arc<AgentRuntime> {
        AgentRuntime::new(
            agent_id("alpha"),
            AgentConfig::new("Alpha", "be concise"),
            llm,
            queue,
            Arc::new(BroadcastBus::new(100, Arc::new(NoopTracer))),
            Arc::new(SharedMemory::new()),
            Arc::new(Semaphore::new(2)),
            Arc::new(NoopTracer),
        )
    }

    #[tokio::test]
    async fn test_should_inject_and_acknowledge_message_when_reply_produced() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        let runtime = runtime_with(Arc::clone(&queue), ScriptedClient::echo());

        queue
            .enqueue(
                &agent_id("alpha"),
                Bytes::from_static(b"hello"),
                &agent_id("tester"),
            )
            .await
            .unwrap();

        let outcome = runtime.tick().await.unwrap();
        let reply = outcome.reply.unwrap();
        // Sender and payload survive the framing.
        assert!(reply.contains("from:tester"));
        assert!(reply.contains("hello"));
        assert_eq!(outcome.acknowledged.len(), 1);

        // Acknowledged: nothing left to dequeue.
        assert!(queue.dequeue(&agent_id("alpha")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_return_idle_outcome_when_no_input_pending() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        let runtime = runtime_with(queue, ScriptedClient::echo());

        let outcome = runtime.tick().await.unwrap();
        assert!(outcome.reply.is_none());
        assert!(outcome.acknowledged.is_empty());
    }

    #[tokio::test]
    async fn test_should_leave_message_in_flight_when_llm_fails() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        let failing = ScriptedClient::with_responses(vec![Err(LlmError::Provider {
            message: "boom".to_string(),
        })]);
        let runtime = runtime_with(Arc::clone(&queue), failing);

        queue
            .enqueue(
                &agent_id("alpha"),
                Bytes::from_static(b"doomed"),
                &agent_id("tester"),
            )
            .await
            .unwrap();

        let err = runtime.tick().await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));

        // Not acknowledged: the message is in flight, not pending and not
        // acknowledged, so a fresh dequeue within the window sees nothing
        // but the row survives.
        assert_eq!(queue.pending_count(&agent_id("alpha")).await.unwrap(), 0);
        assert!(queue.dequeue(&agent_id("alpha")).await.unwrap().is_none());
    }

    struct Doubler;

    #[async_trait]
    impl Tool for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        async fn invoke(&self, arguments: Value) -> Result<String, String> {
            let n = arguments.get("n").and_then(Value::as_i64).ok_or("missing n")?;
            Ok((n * 2).to_string())
        }
    }

    #[tokio::test]
    async fn test_should_run_tool_round_when_model_requests_calls() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        let llm = ScriptedClient::with_responses(vec![
            Ok(CompletionResponse {
                content: "let me compute".to_string(),
                tool_calls: vec![ToolCall {
                    name: "doubler".to_string(),
                    arguments: serde_json::json!({"n": 21}),
                }],
                usage: TokenUsage::zero(),
            }),
            Ok(CompletionResponse {
                content: "the answer is 42".to_string(),
                tool_calls: Vec::new(),
                usage: TokenUsage::zero(),
            }),
        ]);
        let runtime = AgentRuntime::with_tool(
            runtime_with(Arc::clone(&queue), llm.clone()),
            Arc::new(Doubler),
        );

        queue
            .enqueue(
                &agent_id("alpha"),
                Bytes::from_static(b"double 21"),
                &agent_id("tester"),
            )
            .await
            .unwrap();

        let outcome = runtime.tick().await.unwrap();
        assert_eq!(outcome.reply.unwrap(), "the answer is 42");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_should_inject_broadcast_events_when_topics_polled() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        let bus = Arc::new(BroadcastBus::new(100, Arc::new(NoopTracer)));
        let mut config = AgentConfig::new("Alpha", "be concise");
        config.topics = vec![crate::domain_types::TopicName::try_new("news".to_string()).unwrap()];

        let runtime = AgentRuntime::new(
            agent_id("alpha"),
            config,
            ScriptedClient::echo(),
            queue,
            Arc::clone(&bus),
            Arc::new(SharedMemory::new()),
            Arc::new(Semaphore::new(2)),
            Arc::new(NoopTracer),
        );

        bus.publish(
            &crate::domain_types::TopicName::try_new("news".to_string()).unwrap(),
            &agent_id("publisher"),
            Bytes::from_static(b"breaking"),
        );

        let outcome = runtime.tick().await.unwrap();
        let reply = outcome.reply.unwrap();
        assert!(reply.contains("topic:news"));
        assert!(reply.contains("breaking"));
    }
}
