//! SQLite implementation of the message store.
//!
//! Each state transition is a single UPDATE guarded by the current status,
//! so concurrent consumers never duplicate an in-flight row. Dequeue uses
//! `RETURNING` to flip and read in one statement.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::Row;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::database::DatabaseConnection;
use crate::domain_types::{AgentId, MessageId, Timestamp};
use crate::store::{MessageStatus, MessageStore, StoreError, StoredMessage};

const INSERT_MESSAGE: &str = r"
INSERT INTO messages (id, recipient, sender, payload, created_at, updated_at, status, dequeue_count)
VALUES (?, ?, ?, ?, ?, ?, 'pending', 0);
";

// The inner SELECT picks the oldest eligible row in FIFO order; rowid
// breaks created_at ties for messages enqueued in the same millisecond.
const DEQUEUE_MESSAGE: &str = r"
UPDATE messages
SET status = 'in_flight', dequeue_count = dequeue_count + 1, updated_at = ?
WHERE id = (
    SELECT id FROM messages
    WHERE recipient = ?
      AND (status = 'pending' OR (status = 'in_flight' AND updated_at <= ?))
    ORDER BY created_at ASC, rowid ASC
    LIMIT 1
)
RETURNING id, recipient, sender, payload, created_at, updated_at, status, dequeue_count, error;
";

const ACKNOWLEDGE_MESSAGE: &str = r"
UPDATE messages SET status = 'acknowledged', updated_at = ?
WHERE id = ? AND status = 'in_flight';
";

const FAIL_MESSAGE: &str = r"
UPDATE messages SET status = 'failed', error = ?, updated_at = ?
WHERE id = ? AND status = 'in_flight';
";

const RECLAIM_EXPIRED: &str = r"
UPDATE messages SET status = 'pending', updated_at = ?
WHERE status = 'in_flight' AND updated_at <= ?;
";

const COUNT_PENDING: &str = r"
SELECT COUNT(*) AS n FROM messages WHERE recipient = ? AND status = 'pending';
";

const SELECT_MESSAGE: &str = r"
SELECT id, recipient, sender, payload, created_at, updated_at, status, dequeue_count, error
FROM messages WHERE id = ?;
";

const SELECT_STATUS: &str = r"
SELECT status FROM messages WHERE id = ?;
";

const SEARCH_MESSAGES: &str = r"
SELECT m.id, m.recipient, m.sender, m.payload, m.created_at, m.updated_at,
       m.status, m.dequeue_count, m.error
FROM messages m
JOIN messages_fts f ON m.rowid = f.rowid
WHERE messages_fts MATCH ?
ORDER BY m.created_at DESC
LIMIT ?;
";

/// SQLite-backed message store.
pub struct SqliteMessageStore {
    connection: DatabaseConnection,
}

impl SqliteMessageStore {
    /// Wraps an initialized database connection.
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredMessage, StoreError> {
        let id_str: String = row.get("id");
        let id = Uuid::parse_str(&id_str).map_err(|e| StoreError::CorruptRow {
            field: "id".to_string(),
            reason: format!("invalid uuid '{id_str}': {e}"),
        })?;

        let recipient: String = row.get("recipient");
        let recipient = AgentId::try_new(recipient).map_err(|e| StoreError::CorruptRow {
            field: "recipient".to_string(),
            reason: e.to_string(),
        })?;

        let sender: String = row.get("sender");
        let sender = AgentId::try_new(sender).map_err(|e| StoreError::CorruptRow {
            field: "sender".to_string(),
            reason: e.to_string(),
        })?;

        let payload: Vec<u8> = row.get("payload");
        let status: String = row.get("status");
        let dequeue_count: i64 = row.get("dequeue_count");

        Ok(StoredMessage {
            id: MessageId::new(id),
            recipient,
            sender,
            payload: Bytes::from(payload),
            created_at: Timestamp::new(row.get::<i64, _>("created_at")),
            updated_at: Timestamp::new(row.get::<i64, _>("updated_at")),
            status: MessageStatus::parse(&status)?,
            dequeue_count: u32::try_from(dequeue_count).unwrap_or(u32::MAX),
            error: row.get("error"),
        })
    }

    /// Distinguishes "row missing" from "row in the wrong state" after a
    /// guarded UPDATE matched nothing.
    async fn transition_error(&self, id: MessageId, to: &'static str) -> StoreError {
        let row = sqlx::query(SELECT_STATUS)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await;
        match row {
            Ok(Some(row)) => StoreError::InvalidTransition {
                id: id.to_string(),
                from: row.get::<String, _>("status"),
                to,
            },
            Ok(None) => StoreError::MessageNotFound { id },
            Err(source) => StoreError::Database { source },
        }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, payload), fields(recipient = %recipient, sender = %sender))]
    async fn enqueue(
        &self,
        recipient: &AgentId,
        payload: Bytes,
        sender: &AgentId,
    ) -> Result<MessageId, StoreError> {
        let id = MessageId::generate();
        let now = Timestamp::now();

        sqlx::query(INSERT_MESSAGE)
            .bind(id.to_string())
            .bind(recipient.as_str())
            .bind(sender.as_str())
            .bind(payload.to_vec())
            .bind(now.as_millis())
            .bind(now.as_millis())
            .execute(self.connection.pool())
            .await?;

        Ok(id)
    }

    #[instrument(skip(self), fields(recipient = %recipient))]
    async fn dequeue_pending(
        &self,
        recipient: &AgentId,
        now: Timestamp,
        visibility: Duration,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let cutoff = now.minus(visibility);

        let row = sqlx::query(DEQUEUE_MESSAGE)
            .bind(now.as_millis())
            .bind(recipient.as_str())
            .bind(cutoff.as_millis())
            .fetch_optional(self.connection.pool())
            .await?;

        row.as_ref().map(Self::parse_row).transpose()
    }

    #[instrument(skip(self))]
    async fn acknowledge(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query(ACKNOWLEDGE_MESSAGE)
            .bind(Timestamp::now().as_millis())
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "acknowledged").await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, id: MessageId, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(FAIL_MESSAGE)
            .bind(reason)
            .bind(Timestamp::now().as_millis())
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "failed").await);
        }
        warn!(message_id = %id, reason, "message marked failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(
        &self,
        now: Timestamp,
        visibility: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = now.minus(visibility);

        let result = sqlx::query(RECLAIM_EXPIRED)
            .bind(now.as_millis())
            .bind(cutoff.as_millis())
            .execute(self.connection.pool())
            .await?;

        Ok(result.rows_affected())
    }

    async fn pending_count(&self, recipient: &AgentId) -> Result<u64, StoreError> {
        let row = sqlx::query(COUNT_PENDING)
            .bind(recipient.as_str())
            .fetch_one(self.connection.pool())
            .await?;
        let n: i64 = row.get("n");
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn get(&self, id: MessageId) -> Result<Option<StoredMessage>, StoreError> {
        let row = sqlx::query(SELECT_MESSAGE)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(100);
        let rows = sqlx::query(SEARCH_MESSAGES)
            .bind(query)
            .bind(limit)
            .fetch_all(self.connection.pool())
            .await?;

        rows.iter().map(Self::parse_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteMessageStore {
        let path = DatabasePath::new(dir.path().join("messages.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
            .await
            .unwrap();
        SqliteMessageStore::new(connection)
    }

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_should_preserve_fifo_when_single_consumer_dequeues() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = agent("alpha");
        let sender = agent("tester");

        for n in 0..3 {
            store
                .enqueue(&alpha, Bytes::from(format!("msg-{n}")), &sender)
                .await
                .unwrap();
        }

        for n in 0..3 {
            let message = store
                .dequeue_pending(&alpha, Timestamp::now(), Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.payload, Bytes::from(format!("msg-{n}")));
            assert_eq!(message.dequeue_count, 1);
            store.acknowledge(message.id).await.unwrap();
        }

        let empty = store
            .dequeue_pending(&alpha, Timestamp::now(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_should_redeliver_message_when_visibility_expired() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = agent("alpha");
        let sender = agent("tester");
        let visibility = Duration::from_secs(30);

        let id = store
            .enqueue(&alpha, Bytes::from_static(b"hello"), &sender)
            .await
            .unwrap();

        let first = store
            .dequeue_pending(&alpha, Timestamp::now(), visibility)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, id);
        assert_eq!(first.dequeue_count, 1);

        // Within the window nothing is eligible.
        let none = store
            .dequeue_pending(&alpha, Timestamp::now(), visibility)
            .await
            .unwrap();
        assert!(none.is_none());

        // Reclaim from a vantage point past the window, then dequeue again.
        let later = Timestamp::now().plus(Duration::from_secs(31));
        let reclaimed = store.reclaim_expired(later, visibility).await.unwrap();
        assert_eq!(reclaimed, 1);

        let second = store
            .dequeue_pending(&alpha, later, visibility)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, id);
        assert_eq!(second.dequeue_count, 2);
    }

    #[tokio::test]
    async fn test_should_not_reclaim_message_when_still_visible() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = agent("alpha");

        store
            .enqueue(&alpha, Bytes::from_static(b"fresh"), &agent("tester"))
            .await
            .unwrap();
        store
            .dequeue_pending(&alpha, Timestamp::now(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let reclaimed = store
            .reclaim_expired(Timestamp::now(), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[tokio::test]
    async fn test_should_reject_acknowledge_when_message_not_in_flight() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = agent("alpha");

        let id = store
            .enqueue(&alpha, Bytes::from_static(b"pending"), &agent("tester"))
            .await
            .unwrap();

        match store.acknowledge(id).await.unwrap_err() {
            StoreError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "pending");
                assert_eq!(to, "acknowledged");
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }

        let missing = MessageId::generate();
        match store.acknowledge(missing).await.unwrap_err() {
            StoreError::MessageNotFound { id } => assert_eq!(id, missing),
            other => panic!("expected not found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_never_redeliver_message_when_marked_failed() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = agent("alpha");

        let id = store
            .enqueue(&alpha, Bytes::from_static(b"broken"), &agent("tester"))
            .await
            .unwrap();
        store
            .dequeue_pending(&alpha, Timestamp::now(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        store.mark_failed(id, "parse error").await.unwrap();

        let later = Timestamp::now().plus(Duration::from_secs(120));
        store
            .reclaim_expired(later, Duration::from_secs(30))
            .await
            .unwrap();
        let none = store
            .dequeue_pending(&alpha, later, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(none.is_none());

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("parse error"));
    }

    #[tokio::test]
    async fn test_should_find_message_when_payload_matches_search() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = agent("alpha");

        store
            .enqueue(
                &alpha,
                Bytes::from_static(b"deploy the staging cluster"),
                &agent("tester"),
            )
            .await
            .unwrap();
        store
            .enqueue(
                &alpha,
                Bytes::from_static(b"summarize quarterly numbers"),
                &agent("tester"),
            )
            .await
            .unwrap();

        let hits = store.search("staging", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload, Bytes::from_static(b"deploy the staging cluster"));
    }
}
