//! # Weft - Inter-Agent Communication Fabric
//!
//! Weft is the communication and coordination core of a multi-agent LLM
//! runtime: a persistent per-recipient message queue with at-least-once
//! delivery, a typed prioritised interrupt channel with a guaranteed
//! critical path, topic pub/sub, scoped shared memory, and a workflow
//! orchestrator that composes agents into pipeline, parallel, fork-join,
//! debate, conditional, swarm, and event-driven patterns.
//!
//! ## Architecture
//!
//! ```text
//! Caller -> Fabric -> MessageQueue  -> Persistent Store (SQLite)
//!              |  \-> InterruptRouter -> per-(agent, signal) workers
//!              |        ^ retried by PersistentInterruptQueue (critical)
//!              |  \-> BroadcastBus / SharedMemory / AgentRegistry
//!              \-> Orchestrator -> pattern executors -> LLM semaphore
//! ```
//!
//! Every LLM invocation - agent runtime ticks and pattern executors alike
//! - runs under one global semaphore, so the configured concurrency limit
//! holds across the whole process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::{AgentConfig, AgentId, Fabric, FabricConfig, ScriptedClient};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fabric = Fabric::new(FabricConfig::development(), ScriptedClient::echo()).await?;
//! fabric.start();
//!
//! let alpha = AgentId::try_new("alpha".to_string())?;
//! fabric
//!     .create_agent(alpha.clone(), AgentConfig::new("Alpha", "be helpful"))
//!     .await?;
//!
//! let doc = serde_json::json!({
//!     "type": "pipeline",
//!     "initial_prompt": "Summarize:",
//!     "stages": [{"agent": "alpha"}],
//! });
//! let (workflow_id, mut events) = fabric.run_workflow(&doc, "the input").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{workflow_id}: {event:?}");
//! }
//!
//! fabric.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod context;
pub mod database;
pub mod domain_types;
pub mod fabric;
pub mod interrupt;
pub mod llm;
pub mod observability;
pub mod queue;
pub mod registry;
pub mod shared_memory;
pub mod store;
pub mod workflow;

pub use crate::agent::{AgentError, AgentRuntime, TickOutcome, Tool};
pub use crate::broadcast::{BroadcastBus, BroadcastEvent};
pub use crate::config::{ConfigError, FabricConfig, FabricConfigBuilder, TracerMode};
pub use crate::context::RunContext;
pub use crate::domain_types::{
    AgentId, ConcurrencyLimit, InboxLimit, InterruptId, MaxRetries, MessageId, PoisonThreshold,
    RetryBaseMs, SessionId, Timestamp, TopicName, VisibilityTimeoutSecs, WorkflowId,
};
pub use crate::fabric::{Fabric, FabricError, SendOutcome};
pub use crate::interrupt::{
    Interrupt, InterruptHandler, InterruptRouter, PersistentInterruptQueue, PriorityBand,
    RouterError, SendError, SignalCode, signals,
};
pub use crate::llm::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, LlmClient, LlmError,
    ScriptedClient, TokenUsage, ToolCall,
};
pub use crate::observability::{EmbeddedTracer, NoopTracer, SpanGuard, Tracer};
pub use crate::queue::{MessageQueue, QueueError};
pub use crate::registry::{AgentConfig, AgentRegistry, RegistryError};
pub use crate::shared_memory::{MemoryScope, SharedMemory};
pub use crate::store::{
    InterruptState, MessageStatus, MessageStore, QueuedInterrupt, StoreError, StoredMessage,
};
pub use crate::workflow::{
    Orchestrator, WorkflowError, WorkflowEvent, WorkflowSpec, WorkflowStatus,
};
