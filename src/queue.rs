//! Ordered, at-least-once message delivery between agents.
//!
//! The queue wraps the persistent store with policy: bounded per-recipient
//! inboxes, poison-message warnings from the dequeue count, periodic
//! visibility reclaim, and workflow-aware recipient healing against the
//! registry.

use crate::domain_types::{
    AgentId, InboxLimit, MessageId, PoisonThreshold, Timestamp, VisibilityTimeoutSecs,
};
use crate::observability::{Tracer, metrics};
use crate::registry::AgentRegistry;
use crate::store::{MessageStore, StoreError, StoredMessage};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Message queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The recipient's pending inbox is at capacity.
    #[error("inbox full for {recipient}: {limit} pending messages")]
    InboxFull { recipient: AgentId, limit: u64 },

    /// Store failure; the caller may retry.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-recipient ordered queue with visibility-timeout recovery.
pub struct MessageQueue {
    store: Arc<dyn MessageStore>,
    registry: Arc<AgentRegistry>,
    tracer: Arc<dyn Tracer>,
    visibility: VisibilityTimeoutSecs,
    inbox_limit: InboxLimit,
    poison_threshold: PoisonThreshold,
}

impl MessageQueue {
    /// Creates a queue over the given store and registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<AgentRegistry>,
        tracer: Arc<dyn Tracer>,
        visibility: VisibilityTimeoutSecs,
        inbox_limit: InboxLimit,
        poison_threshold: PoisonThreshold,
    ) -> Self {
        Self {
            store,
            registry,
            tracer,
            visibility,
            inbox_limit,
            poison_threshold,
        }
    }

    /// Enqueues a message, healing the recipient id when the sender is in
    /// a workflow context.
    ///
    /// Healing: a composite sender (`planner:coord`) addressing a bare
    /// recipient (`analyst`) is probed against the registry as
    /// `planner:analyst`; on a hit the scoped id is substituted. There is
    /// no fallback to broadcast.
    ///
    /// # Errors
    ///
    /// `InboxFull` when the recipient's pending count is at the cap;
    /// `Store` on persistence failure.
    #[instrument(skip(self, payload), fields(recipient = %recipient, sender = %sender))]
    pub async fn enqueue(
        &self,
        recipient: &AgentId,
        payload: Bytes,
        sender: &AgentId,
    ) -> Result<MessageId, QueueError> {
        let recipient = self.heal_recipient(recipient, sender).await;

        let pending = self.store.pending_count(&recipient).await?;
        if pending >= self.inbox_limit.as_u64() {
            return Err(QueueError::InboxFull {
                recipient,
                limit: self.inbox_limit.as_u64(),
            });
        }

        let id = self.store.enqueue(&recipient, payload, sender).await?;
        Ok(id)
    }

    /// Dequeues the oldest visible message for a recipient, flipping it to
    /// in-flight and bumping its dequeue count.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn dequeue(&self, recipient: &AgentId) -> Result<Option<StoredMessage>, QueueError> {
        let message = self
            .store
            .dequeue_pending(recipient, Timestamp::now(), self.visibility.as_duration())
            .await?;

        if let Some(message) = &message {
            self.tracer.record_metric(metrics::MESSAGE_DEQUEUED, 1.0);
            if message.dequeue_count >= self.poison_threshold.as_u32() {
                self.tracer
                    .record_metric(metrics::MESSAGE_POISON_SUSPECT, 1.0);
                warn!(
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    "message repeatedly dequeued without acknowledgement"
                );
            }
        }

        Ok(message)
    }

    /// Acknowledges an in-flight message.
    ///
    /// # Errors
    ///
    /// `Store` when the message is missing or not in-flight.
    pub async fn acknowledge(&self, id: MessageId) -> Result<(), QueueError> {
        self.store.acknowledge(id).await?;
        Ok(())
    }

    /// Marks an in-flight message failed; it is never redelivered.
    ///
    /// # Errors
    ///
    /// `Store` when the message is missing or not in-flight.
    pub async fn fail(&self, id: MessageId, reason: &str) -> Result<(), QueueError> {
        self.store.mark_failed(id, reason).await?;
        Ok(())
    }

    /// Returns expired in-flight messages to pending. Returns the number
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn reclaim(&self) -> Result<u64, QueueError> {
        let reclaimed = self
            .store
            .reclaim_expired(Timestamp::now(), self.visibility.as_duration())
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "returned expired in-flight messages to pending");
        }
        Ok(reclaimed)
    }

    /// Number of pending messages for a recipient.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn pending_count(&self, recipient: &AgentId) -> Result<u64, QueueError> {
        Ok(self.store.pending_count(recipient).await?)
    }

    /// Full-text search over message payloads, most recent first.
    ///
    /// # Errors
    ///
    /// `Store` on persistence failure.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>, QueueError> {
        Ok(self.store.search(query, limit).await?)
    }

    /// The configured visibility window.
    #[must_use]
    pub fn visibility(&self) -> VisibilityTimeoutSecs {
        self.visibility
    }

    async fn heal_recipient(&self, recipient: &AgentId, sender: &AgentId) -> AgentId {
        if recipient.is_composite() {
            return recipient.clone();
        }
        let Some(workflow) = sender.workflow_scope() else {
            return recipient.clone();
        };
        let Ok(scoped) = AgentId::composite(workflow, recipient.as_str()) else {
            return recipient.clone();
        };
        if self.registry.contains(&scoped).await {
            info!(
                original = %recipient,
                healed = %scoped,
                sender = %sender,
                "recipient id healed to workflow scope"
            );
            return scoped;
        }
        recipient.clone()
    }
}
