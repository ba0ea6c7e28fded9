//! The transport-agnostic binding point of the fabric.
//!
//! `Fabric` owns every core component and exposes the operations a
//! gateway (gRPC, REST, or in-process caller) binds to: message queue,
//! interrupts, workflows, shared memory, broadcast, and the registry.
//! The LLM provider client is injected; wire formats are the gateway's
//! concern.

use crate::agent::AgentRuntime;
use crate::broadcast::{BroadcastBus, BroadcastEvent};
use crate::config::{ConfigError, FabricConfig};
use crate::context::RunContext;
use crate::database::{DatabaseConfig, DatabaseConnection, DatabaseError, DatabasePath};
use crate::domain_types::{AgentId, InterruptId, MessageId, TopicName, WorkflowId};
use crate::interrupt::persistent_queue::{PersistentInterruptQueue, PersistentQueueError};
use crate::interrupt::router::{InterruptHandler, InterruptRouter, RouterError, SendError};
use crate::interrupt::{Interrupt, SignalCode};
use crate::llm::LlmClient;
use crate::observability::{Tracer, log_tracer_mode, tracer_for_mode};
use crate::queue::{MessageQueue, QueueError};
use crate::registry::{AgentConfig, AgentRegistry, RegistryError};
use crate::shared_memory::{MemoryScope, SharedMemory};
use crate::store::{
    InterruptStore, MessageStore, SqliteInterruptStore, SqliteMessageStore, StoreError,
    StoredMessage,
};
use crate::workflow::event::{WorkflowEvent, WorkflowStatus};
use crate::workflow::{Orchestrator, WorkflowError};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Umbrella error for fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Router(#[from] RouterError),

    /// A non-critical interrupt could not be dispatched (`delivered =
    /// false`).
    #[error(transparent)]
    InterruptSend(#[from] SendError),

    #[error(transparent)]
    PersistentQueue(#[from] PersistentQueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// How `SendInterrupt` handled the signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Critical: persisted for guaranteed delivery; the id acknowledges
    /// later.
    Enqueued(InterruptId),
    /// Non-critical: handed to the in-memory router.
    Dispatched,
}

/// The assembled communication fabric.
pub struct Fabric {
    config: FabricConfig,
    database: DatabaseConnection,
    registry: Arc<AgentRegistry>,
    queue: Arc<MessageQueue>,
    bus: Arc<BroadcastBus>,
    memory: Arc<SharedMemory>,
    router: Arc<InterruptRouter>,
    persistent: Arc<PersistentInterruptQueue>,
    orchestrator: Orchestrator,
    llm: Arc<dyn LlmClient>,
    gate: Arc<Semaphore>,
    tracer: Arc<dyn Tracer>,
    token: CancellationToken,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Fabric {
    /// Builds the fabric: opens the store, wires every component, and
    /// threads the single global LLM semaphore through the orchestrator
    /// and agent hosting.
    ///
    /// # Errors
    ///
    /// Configuration and database initialization failures.
    pub async fn new(
        config: FabricConfig,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Arc<Self>, FabricError> {
        config.validate()?;
        let tracer = tracer_for_mode(config.tracer);
        log_tracer_mode(config.tracer);

        let database = DatabaseConnection::initialize(
            DatabaseConfig::new(DatabasePath::new(&config.store.path)?)
                .with_pool_size(config.store.pool_size),
        )
        .await?;

        let message_store: Arc<dyn MessageStore> =
            Arc::new(SqliteMessageStore::new(database.clone()));
        let interrupt_store: Arc<dyn InterruptStore> =
            Arc::new(SqliteInterruptStore::new(database.clone()));

        let registry = Arc::new(AgentRegistry::new());
        let memory = Arc::new(SharedMemory::new());
        let bus = Arc::new(BroadcastBus::new(
            config.interrupt.broadcast_buffer.as_usize(),
            Arc::clone(&tracer),
        ));
        let queue = Arc::new(MessageQueue::new(
            message_store,
            Arc::clone(&registry),
            Arc::clone(&tracer),
            config.queue.visibility_timeout_seconds,
            config.queue.inbox_limit,
            config.queue.poison_threshold,
        ));
        let router = Arc::new(InterruptRouter::new(Arc::clone(&tracer)));
        let persistent = Arc::new(PersistentInterruptQueue::new(
            interrupt_store,
            Arc::clone(&router),
            Arc::clone(&tracer),
            config.interrupt.retry_max,
            config.interrupt.retry_base_ms,
            config.gc_interval(),
            config.ack_ttl(),
        ));

        let gate = Arc::new(Semaphore::new(config.llm.concurrency_limit.as_usize()));
        let orchestrator = Orchestrator::new(
            Arc::clone(&llm),
            Arc::clone(&gate),
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&bus),
            Arc::clone(&memory),
            Arc::clone(&tracer),
            config.llm.circuit_breaker_threshold,
        );

        Ok(Arc::new(Self {
            config,
            database,
            registry,
            queue,
            bus,
            memory,
            router,
            persistent,
            orchestrator,
            llm,
            gate,
            tracer,
            token: CancellationToken::new(),
            background: std::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Starts the background machinery: the critical-interrupt retry
    /// loop, its GC sweep, and the visibility reclaim sweeper.
    pub fn start(self: &Arc<Self>) {
        self.persistent.start();

        let fabric = Arc::clone(self);
        let period = self
            .config
            .queue
            .visibility_timeout_seconds
            .as_duration()
            .div_f32(2.0)
            .max(Duration::from_secs(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = fabric.queue.reclaim().await {
                            warn!(error = %e, "visibility reclaim sweep failed");
                        }
                    }
                    () = fabric.token.cancelled() => break,
                }
            }
        });
        self.background
            .lock()
            .expect("background task lock poisoned")
            .push(sweeper);
        info!("fabric started");
    }

    /// Graceful shutdown: stops sweeps, drains the interrupt router, and
    /// closes the store.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = {
            let mut guard = self
                .background
                .lock()
                .expect("background task lock poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        self.persistent.close().await;
        self.router.close().await;
        self.database.close().await;
        info!("fabric shut down");
    }

    // --- Message queue operations ---

    /// Enqueues a message for a recipient.
    ///
    /// # Errors
    ///
    /// Back-pressure and store failures.
    pub async fn enqueue_message(
        &self,
        recipient: &AgentId,
        payload: Bytes,
        sender: &AgentId,
    ) -> Result<MessageId, FabricError> {
        Ok(self.queue.enqueue(recipient, payload, sender).await?)
    }

    /// Dequeues the next message for a recipient, if any.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn dequeue_message(
        &self,
        recipient: &AgentId,
    ) -> Result<Option<StoredMessage>, FabricError> {
        Ok(self.queue.dequeue(recipient).await?)
    }

    /// Acknowledges an in-flight message.
    ///
    /// # Errors
    ///
    /// Unknown id or wrong state.
    pub async fn acknowledge_message(&self, id: MessageId) -> Result<(), FabricError> {
        Ok(self.queue.acknowledge(id).await?)
    }

    /// Marks an in-flight message failed; it is never redelivered.
    ///
    /// # Errors
    ///
    /// Unknown id or wrong state.
    pub async fn fail_message(&self, id: MessageId, reason: &str) -> Result<(), FabricError> {
        Ok(self.queue.fail(id, reason).await?)
    }

    /// Returns expired in-flight messages to pending.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn reclaim_expired(&self) -> Result<u64, FabricError> {
        Ok(self.queue.reclaim().await?)
    }

    /// Number of pending messages for a recipient.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn pending_count(&self, recipient: &AgentId) -> Result<u64, FabricError> {
        Ok(self.queue.pending_count(recipient).await?)
    }

    /// Full-text search over stored message payloads.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, FabricError> {
        Ok(self.queue.search(query, limit).await?)
    }

    // --- Interrupt operations ---

    /// Sends an interrupt. Critical signals are persisted before this
    /// returns and retried until delivered; non-critical signals are
    /// dispatched in-memory and may be dropped under saturation.
    ///
    /// # Errors
    ///
    /// For non-critical signals, `InterruptSend` reports the drop; for
    /// critical signals, `PersistentQueue` reports persistence failure.
    pub async fn send_interrupt(
        &self,
        signal: SignalCode,
        target: &AgentId,
        payload: Bytes,
        sender: &AgentId,
    ) -> Result<SendOutcome, FabricError> {
        let interrupt = Interrupt::new(signal, target.clone(), payload, sender.clone());
        if signal.is_critical() {
            let id = self.persistent.enqueue(&interrupt).await?;
            Ok(SendOutcome::Enqueued(id))
        } else {
            self.router.send(interrupt)?;
            Ok(SendOutcome::Dispatched)
        }
    }

    /// Acknowledges a delivered critical interrupt. Critical only.
    ///
    /// # Errors
    ///
    /// Unknown id or wrong state.
    pub async fn ack_interrupt(&self, id: InterruptId) -> Result<(), FabricError> {
        Ok(self.persistent.acknowledge(id).await?)
    }

    /// Registers an interrupt handler for an (agent, signal) pair.
    ///
    /// # Errors
    ///
    /// `Router` when the pair is taken or the router closed.
    pub fn register_interrupt_handler(
        &self,
        agent: AgentId,
        signal: SignalCode,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), FabricError> {
        Ok(self.router.register_handler(agent, signal, handler)?)
    }

    /// Removes an interrupt handler.
    ///
    /// # Errors
    ///
    /// `Router` when no handler is registered for the pair.
    pub fn unregister_interrupt_handler(
        &self,
        agent: &AgentId,
        signal: SignalCode,
    ) -> Result<(), FabricError> {
        Ok(self.router.unregister_handler(agent, signal)?)
    }

    // --- Workflow operations ---

    /// Launches a workflow from a spec document.
    ///
    /// # Errors
    ///
    /// Validation and unknown-agent errors, before anything is activated.
    pub async fn run_workflow(
        &self,
        doc: &Value,
        initial_input: &str,
    ) -> Result<(WorkflowId, mpsc::Receiver<WorkflowEvent>), FabricError> {
        Ok(self.orchestrator.run_workflow(doc, initial_input).await?)
    }

    /// Requests cancellation of a running workflow.
    ///
    /// # Errors
    ///
    /// `Workflow` for unknown ids.
    pub fn cancel_workflow(&self, id: WorkflowId) -> Result<(), FabricError> {
        Ok(self.orchestrator.cancel_workflow(id)?)
    }

    /// Current status of a workflow.
    ///
    /// # Errors
    ///
    /// `Workflow` for unknown ids.
    pub async fn get_workflow_status(&self, id: WorkflowId) -> Result<WorkflowStatus, FabricError> {
        Ok(self.orchestrator.get_workflow_status(id).await?)
    }

    // --- Shared memory operations ---

    /// Writes a scoped value.
    pub fn memory_write(&self, scope: MemoryScope, key: &str, value: Bytes) {
        self.memory.write(scope, key, value);
    }

    /// Reads a scoped value.
    #[must_use]
    pub fn memory_read(&self, scope: MemoryScope, key: &str) -> Option<Bytes> {
        self.memory.read(scope, key)
    }

    /// Deletes a scoped value. Returns whether it existed.
    pub fn memory_delete(&self, scope: MemoryScope, key: &str) -> bool {
        self.memory.delete(scope, key)
    }

    /// Lists scoped values under a key prefix.
    #[must_use]
    pub fn memory_list(&self, scope: MemoryScope, prefix: &str) -> Vec<(String, Bytes)> {
        self.memory.list(scope, prefix)
    }

    // --- Broadcast operations ---

    /// Subscribes an agent to a topic.
    pub fn subscribe(&self, agent: &AgentId, topic: &TopicName) {
        self.bus.subscribe(agent, topic);
    }

    /// Unsubscribes an agent from a topic.
    pub fn unsubscribe(&self, agent: &AgentId, topic: &TopicName) {
        self.bus.unsubscribe(agent, topic);
    }

    /// Publishes to a topic; returns the number of subscribers reached.
    pub fn publish(&self, topic: &TopicName, publisher: &AgentId, payload: Bytes) -> usize {
        self.bus.publish(topic, publisher, payload)
    }

    /// Drains buffered events for an agent.
    #[must_use]
    pub fn poll(&self, agent: &AgentId) -> Vec<BroadcastEvent> {
        self.bus.poll(agent)
    }

    // --- Registry operations ---

    /// Registers a standing agent.
    ///
    /// # Errors
    ///
    /// `Registry` when the id is taken.
    pub async fn create_agent(
        &self,
        id: AgentId,
        config: AgentConfig,
    ) -> Result<(), FabricError> {
        Ok(self.registry.create_agent(id, config).await?)
    }

    /// Looks up an agent configuration.
    ///
    /// # Errors
    ///
    /// `Registry` for unknown ids.
    pub async fn lookup_agent(&self, id: &AgentId) -> Result<AgentConfig, FabricError> {
        Ok(self.registry.lookup(id).await?)
    }

    /// Lists every registered agent id.
    pub async fn list_agents(&self) -> Vec<AgentId> {
        self.registry.list_agents().await
    }

    // --- Agent hosting ---

    /// Builds a hosted conversation loop for a registered agent, wired to
    /// this fabric's queue, bus, memory, and LLM gate. The caller drives
    /// it with [`AgentRuntime::run`] under a [`RunContext`].
    ///
    /// # Errors
    ///
    /// `Registry` for unknown ids.
    pub async fn host_agent(&self, id: &AgentId) -> Result<Arc<AgentRuntime>, FabricError> {
        let config = self.registry.lookup(id).await?;
        Ok(AgentRuntime::new(
            id.clone(),
            config,
            Arc::clone(&self.llm),
            Arc::clone(&self.queue),
            Arc::clone(&self.bus),
            Arc::clone(&self.memory),
            Arc::clone(&self.gate),
            Arc::clone(&self.tracer),
        ))
    }

    /// A root context for driving hosted agents, cancelled on fabric
    /// shutdown.
    #[must_use]
    pub fn run_context(&self) -> RunContext {
        RunContext::root()
    }

    /// The configuration this fabric was built with.
    #[must_use]
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }
}
