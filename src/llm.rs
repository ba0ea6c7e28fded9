//! LLM provider seam.
//!
//! Provider clients are external collaborators; the fabric only depends on
//! the [`LlmClient`] trait. Implementations must be thread-safe so one
//! client can serve every agent and pattern executor, and must surface
//! token accounting so the orchestrator can aggregate usage per stage.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Primes or constrains assistant behaviour.
    System,
    /// End-user or fabric-injected input.
    User,
    /// Model output.
    Assistant,
    /// Result of a tool invocation.
    Tool,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// A user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    /// A tool-result message.
    #[must_use]
    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
        }
    }
}

/// Token and cost accounting for one completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens billed by the provider.
    pub prompt_tokens: u64,
    /// Completion tokens billed by the provider.
    pub completion_tokens: u64,
    /// Provider cost in USD.
    pub cost: Decimal,
}

impl TokenUsage {
    /// Zero usage.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Adds another usage record into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost += other.cost;
    }

    /// Total billed tokens.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Registered tool name.
    pub name: String,
    /// Provider-parsed arguments.
    pub arguments: Value,
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model override; `None` uses the client default.
    pub model: Option<String>,
    /// Full conversation, system prompt included.
    pub messages: Vec<ChatMessage>,
    /// Output token cap; `None` uses the client default.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// A request with no overrides.
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            model: None,
            messages,
            max_tokens: None,
        }
    }

    /// Sets a model override.
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Assistant text.
    pub content: String,
    /// Native tool calls, empty when the model answered directly.
    pub tool_calls: Vec<ToolCall>,
    /// Token accounting for this call.
    pub usage: TokenUsage,
}

/// LLM invocation errors.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// The model hit its output token ceiling. Repeated occurrences
    /// within a workflow stage trip the circuit breaker.
    #[error("output token limit reached for model '{model}'")]
    OutputTokenLimit { model: String },

    /// Provider-side failure.
    #[error("provider error: {message}")]
    Provider { message: String },

    /// The request did not complete in time.
    #[error("completion timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Interface to an LLM provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Runs one chat completion.
    ///
    /// Callers inside the fabric hold a permit of the global concurrency
    /// semaphore across this call.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Identifier of the default model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;
}

/// Deterministic client for tests and offline runs.
///
/// Responses are served from a script in order; when the script runs dry
/// the client echoes the last user message. Failures can be injected at
/// specific call indices.
pub struct ScriptedClient {
    model: String,
    script: std::sync::Mutex<std::collections::VecDeque<Result<CompletionResponse, LlmError>>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedClient {
    /// A client that echoes user input.
    #[must_use]
    pub fn echo() -> Arc<Self> {
        Self::with_responses(Vec::new())
    }

    /// A client that serves the given responses in order, then echoes.
    #[must_use]
    pub fn with_responses(responses: Vec<Result<CompletionResponse, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            model: "scripted".to_string(),
            script: std::sync::Mutex::new(responses.into_iter().collect()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Number of completions served so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let scripted = self.script.lock().expect("script lock poisoned").pop_front();
        match scripted {
            Some(result) => result,
            None => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == ChatRole::User)
                    .map_or_else(String::new, |m| m.content.clone());
                Ok(CompletionResponse {
                    content: format!("echo: {last_user}"),
                    tool_calls: Vec::new(),
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        cost: Decimal::ZERO,
                    },
                })
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
