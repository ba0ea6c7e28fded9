//! Persistent store for messages and critical interrupts.
//!
//! Trait seams keep the queue and retry loop decoupled from SQLite; the
//! concrete implementations live in the submodules and persist every state
//! transition before reporting success.
//!
//! # Submodules
//!
//! - `message_store` - SQLite message rows with visibility-timeout recovery
//! - `interrupt_store` - SQLite critical-interrupt rows for the retry loop

use crate::domain_types::{AgentId, InterruptId, MessageId, Timestamp};
use crate::interrupt::{Interrupt, SignalCode};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub mod interrupt_store;
pub mod message_store;

pub use interrupt_store::SqliteInterruptStore;
pub use message_store::SqliteMessageStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message row with the given id.
    #[error("message not found: {id}")]
    MessageNotFound { id: MessageId },

    /// No interrupt row with the given id.
    #[error("interrupt not found: {id}")]
    InterruptNotFound { id: InterruptId },

    /// The row exists but is not in a state the operation applies to.
    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: &'static str,
    },

    /// Error surfaced by `SQLx`.
    #[error("database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    /// A persisted value failed to parse back into its domain type.
    #[error("corrupt row: {field} - {reason}")]
    CorruptRow { field: String, reason: String },
}

/// Lifecycle status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Waiting to be dequeued.
    Pending,
    /// Dequeued, within the visibility window.
    InFlight,
    /// Consumer confirmed processing.
    Acknowledged,
    /// Marked undeliverable; never redelivered.
    Failed,
}

impl MessageStatus {
    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::CorruptRow` for unknown values.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            unknown => Err(StoreError::CorruptRow {
                field: "status".to_string(),
                reason: format!("unknown message status '{unknown}'"),
            }),
        }
    }
}

/// A persisted message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub recipient: AgentId,
    pub sender: AgentId,
    pub payload: Bytes,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub status: MessageStatus,
    pub dequeue_count: u32,
    pub error: Option<String>,
}

/// Lifecycle state of a persisted critical interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterruptState {
    /// Awaiting a successful delivery attempt.
    Pending,
    /// Handed to the router; awaiting handler acknowledgement.
    Delivered,
    /// Handler completed the demanded work.
    Acknowledged,
    /// Retries exhausted.
    Failed,
}

impl InterruptState {
    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::CorruptRow` for unknown values.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            unknown => Err(StoreError::CorruptRow {
                field: "state".to_string(),
                reason: format!("unknown interrupt state '{unknown}'"),
            }),
        }
    }
}

/// A persisted critical-interrupt row.
#[derive(Debug, Clone)]
pub struct QueuedInterrupt {
    pub id: InterruptId,
    pub signal: SignalCode,
    pub target: AgentId,
    pub payload: Bytes,
    pub sender: AgentId,
    pub created_at: Timestamp,
    pub enqueued_at: Timestamp,
    pub delivered_at: Option<Timestamp>,
    pub ack_at: Option<Timestamp>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: InterruptState,
    pub error: Option<String>,
}

impl QueuedInterrupt {
    /// The in-memory interrupt this row persists, carrying the row id so
    /// the handler can acknowledge after finishing the work.
    #[must_use]
    pub fn to_interrupt(&self) -> Interrupt {
        Interrupt {
            signal: self.signal,
            target: self.target.clone(),
            payload: self.payload.clone(),
            sender: self.sender.clone(),
            created_at: self.created_at,
            persisted_id: Some(self.id),
        }
    }
}

/// Durable, ordered message persistence.
///
/// Per-recipient FIFO is preserved when a single consumer pulls serially;
/// concurrent consumers for the same recipient may interleave but never
/// observe the same in-flight row twice.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Appends a pending message and returns its id.
    async fn enqueue(
        &self,
        recipient: &AgentId,
        payload: Bytes,
        sender: &AgentId,
    ) -> Result<MessageId, StoreError>;

    /// Atomically flips the oldest eligible message for `recipient` to
    /// in-flight, incrementing its dequeue count and stamping
    /// `updated_at = now`.
    ///
    /// Eligible rows are pending rows plus in-flight rows whose
    /// `updated_at` is older than the visibility window.
    async fn dequeue_pending(
        &self,
        recipient: &AgentId,
        now: Timestamp,
        visibility: Duration,
    ) -> Result<Option<StoredMessage>, StoreError>;

    /// Transitions an in-flight message to acknowledged.
    async fn acknowledge(&self, id: MessageId) -> Result<(), StoreError>;

    /// Transitions an in-flight message to failed with a reason.
    async fn mark_failed(&self, id: MessageId, reason: &str) -> Result<(), StoreError>;

    /// Returns in-flight rows older than the visibility window to pending.
    /// Returns the number of rows reclaimed.
    async fn reclaim_expired(&self, now: Timestamp, visibility: Duration)
    -> Result<u64, StoreError>;

    /// Number of pending rows for a recipient.
    async fn pending_count(&self, recipient: &AgentId) -> Result<u64, StoreError>;

    /// Fetches a message by id.
    async fn get(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError>;

    /// Full-text search over message payloads, most recent first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Durable critical-interrupt persistence for the retry loop.
#[async_trait]
pub trait InterruptStore: Send + Sync {
    /// Appends a pending row with retry count 0 and returns its id.
    async fn enqueue(
        &self,
        interrupt: &Interrupt,
        max_retries: u32,
    ) -> Result<InterruptId, StoreError>;

    /// Oldest pending rows, up to `limit`.
    async fn list_pending(&self, limit: usize) -> Result<Vec<QueuedInterrupt>, StoreError>;

    /// Transitions a pending row to delivered.
    async fn mark_delivered(&self, id: InterruptId, at: Timestamp) -> Result<(), StoreError>;

    /// Increments the retry count and records the last error. Returns the
    /// new count.
    async fn increment_retry(&self, id: InterruptId, error: &str) -> Result<u32, StoreError>;

    /// Transitions a row to failed, preserving the last error.
    async fn mark_failed(&self, id: InterruptId, error: &str) -> Result<(), StoreError>;

    /// Transitions a delivered row to acknowledged.
    async fn acknowledge(&self, id: InterruptId, at: Timestamp) -> Result<(), StoreError>;

    /// Deletes acknowledged rows whose `ack_at` is older than the cutoff.
    /// Returns the number of rows removed.
    async fn clear_old(&self, older_than: Timestamp) -> Result<u64, StoreError>;

    /// Fetches a row by id.
    async fn get(&self, id: InterruptId) -> Result<Option<QueuedInterrupt>, StoreError>;

    /// Number of pending rows for a signal + target pair.
    async fn pending_count_for(
        &self,
        signal: SignalCode,
        target: &AgentId,
    ) -> Result<u64, StoreError>;
}
