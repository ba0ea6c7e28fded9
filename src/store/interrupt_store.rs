//! SQLite implementation of the critical-interrupt store.
//!
//! Rows move pending -> delivered -> acknowledged (or pending -> failed)
//! under guarded UPDATEs so the retry loop and handler acknowledgements
//! cannot race a row into an impossible state.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::Row;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::database::DatabaseConnection;
use crate::domain_types::{AgentId, InterruptId, Timestamp};
use crate::interrupt::{Interrupt, SignalCode};
use crate::store::{InterruptState, InterruptStore, QueuedInterrupt, StoreError};

const INSERT_INTERRUPT: &str = r"
INSERT INTO critical_interrupts
    (id, signal, target, payload, sender, created_at, enqueued_at, retry_count, max_retries, state)
VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 'pending');
";

const LIST_PENDING: &str = r"
SELECT id, signal, target, payload, sender, created_at, enqueued_at,
       delivered_at, ack_at, retry_count, max_retries, state, error
FROM critical_interrupts
WHERE state = 'pending'
ORDER BY created_at ASC
LIMIT ?;
";

const MARK_DELIVERED: &str = r"
UPDATE critical_interrupts SET state = 'delivered', delivered_at = ?
WHERE id = ? AND state = 'pending';
";

const INCREMENT_RETRY: &str = r"
UPDATE critical_interrupts SET retry_count = retry_count + 1, error = ?
WHERE id = ? AND state = 'pending'
RETURNING retry_count;
";

const MARK_FAILED: &str = r"
UPDATE critical_interrupts SET state = 'failed', error = ?
WHERE id = ? AND state IN ('pending', 'delivered');
";

const ACKNOWLEDGE: &str = r"
UPDATE critical_interrupts SET state = 'acknowledged', ack_at = ?
WHERE id = ? AND state = 'delivered';
";

const CLEAR_OLD: &str = r"
DELETE FROM critical_interrupts WHERE state = 'acknowledged' AND ack_at <= ?;
";

const SELECT_INTERRUPT: &str = r"
SELECT id, signal, target, payload, sender, created_at, enqueued_at,
       delivered_at, ack_at, retry_count, max_retries, state, error
FROM critical_interrupts WHERE id = ?;
";

const SELECT_STATE: &str = r"
SELECT state FROM critical_interrupts WHERE id = ?;
";

const COUNT_PENDING_FOR: &str = r"
SELECT COUNT(*) AS n FROM critical_interrupts
WHERE state = 'pending' AND signal = ? AND target = ?;
";

/// SQLite-backed critical-interrupt store.
pub struct SqliteInterruptStore {
    connection: DatabaseConnection,
}

impl SqliteInterruptStore {
    /// Wraps an initialized database connection.
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueuedInterrupt, StoreError> {
        let id_str: String = row.get("id");
        let id = Uuid::parse_str(&id_str).map_err(|e| StoreError::CorruptRow {
            field: "id".to_string(),
            reason: format!("invalid uuid '{id_str}': {e}"),
        })?;

        let signal: i64 = row.get("signal");
        let signal = u32::try_from(signal)
            .ok()
            .and_then(|code| SignalCode::try_new(code).ok())
            .ok_or_else(|| StoreError::CorruptRow {
                field: "signal".to_string(),
                reason: format!("signal code {signal} is outside the recognised bands"),
            })?;

        let target: String = row.get("target");
        let target = AgentId::try_new(target).map_err(|e| StoreError::CorruptRow {
            field: "target".to_string(),
            reason: e.to_string(),
        })?;

        let sender: String = row.get("sender");
        let sender = AgentId::try_new(sender).map_err(|e| StoreError::CorruptRow {
            field: "sender".to_string(),
            reason: e.to_string(),
        })?;

        let payload: Vec<u8> = row.get("payload");
        let state: String = row.get("state");

        Ok(QueuedInterrupt {
            id: InterruptId::new(id),
            signal,
            target,
            payload: Bytes::from(payload),
            sender,
            created_at: Timestamp::new(row.get::<i64, _>("created_at")),
            enqueued_at: Timestamp::new(row.get::<i64, _>("enqueued_at")),
            delivered_at: row.get::<Option<i64>, _>("delivered_at").map(Timestamp::new),
            ack_at: row.get::<Option<i64>, _>("ack_at").map(Timestamp::new),
            retry_count: u32::try_from(row.get::<i64, _>("retry_count")).unwrap_or(u32::MAX),
            max_retries: u32::try_from(row.get::<i64, _>("max_retries")).unwrap_or(u32::MAX),
            state: InterruptState::parse(&state)?,
            error: row.get("error"),
        })
    }

    async fn transition_error(&self, id: InterruptId, to: &'static str) -> StoreError {
        let row = sqlx::query(SELECT_STATE)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await;
        match row {
            Ok(Some(row)) => StoreError::InvalidTransition {
                id: id.to_string(),
                from: row.get::<String, _>("state"),
                to,
            },
            Ok(None) => StoreError::InterruptNotFound { id },
            Err(source) => StoreError::Database { source },
        }
    }
}

#[async_trait]
impl InterruptStore for SqliteInterruptStore {
    #[instrument(skip(self, interrupt), fields(signal = %interrupt.signal, target = %interrupt.target))]
    async fn enqueue(
        &self,
        interrupt: &Interrupt,
        max_retries: u32,
    ) -> Result<InterruptId, StoreError> {
        let id = InterruptId::generate();
        let now = Timestamp::now();

        sqlx::query(INSERT_INTERRUPT)
            .bind(id.to_string())
            .bind(i64::from(interrupt.signal.as_u32()))
            .bind(interrupt.target.as_str())
            .bind(interrupt.payload.to_vec())
            .bind(interrupt.sender.as_str())
            .bind(interrupt.created_at.as_millis())
            .bind(now.as_millis())
            .bind(i64::from(max_retries))
            .execute(self.connection.pool())
            .await?;

        Ok(id)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<QueuedInterrupt>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(100);
        let rows = sqlx::query(LIST_PENDING)
            .bind(limit)
            .fetch_all(self.connection.pool())
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    #[instrument(skip(self))]
    async fn mark_delivered(&self, id: InterruptId, at: Timestamp) -> Result<(), StoreError> {
        let result = sqlx::query(MARK_DELIVERED)
            .bind(at.as_millis())
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "delivered").await);
        }
        Ok(())
    }

    async fn increment_retry(&self, id: InterruptId, error: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(INCREMENT_RETRY)
            .bind(error)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;

        match row {
            Some(row) => {
                let count: i64 = row.get("retry_count");
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            None => Err(self.transition_error(id, "pending").await),
        }
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, id: InterruptId, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(MARK_FAILED)
            .bind(error)
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "failed").await);
        }
        warn!(interrupt_id = %id, error, "critical interrupt marked failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn acknowledge(&self, id: InterruptId, at: Timestamp) -> Result<(), StoreError> {
        let result = sqlx::query(ACKNOWLEDGE)
            .bind(at.as_millis())
            .bind(id.to_string())
            .execute(self.connection.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "acknowledged").await);
        }
        Ok(())
    }

    async fn clear_old(&self, older_than: Timestamp) -> Result<u64, StoreError> {
        let result = sqlx::query(CLEAR_OLD)
            .bind(older_than.as_millis())
            .execute(self.connection.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: InterruptId) -> Result<Option<QueuedInterrupt>, StoreError> {
        let row = sqlx::query(SELECT_INTERRUPT)
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn pending_count_for(
        &self,
        signal: SignalCode,
        target: &AgentId,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(COUNT_PENDING_FOR)
            .bind(i64::from(signal.as_u32()))
            .bind(target.as_str())
            .fetch_one(self.connection.pool())
            .await?;
        let n: i64 = row.get("n");
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabasePath};
    use crate::interrupt::signals;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> SqliteInterruptStore {
        let path = DatabasePath::new(dir.path().join("interrupts.db")).unwrap();
        let connection = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
            .await
            .unwrap();
        SqliteInterruptStore::new(connection)
    }

    fn interrupt_for(target: &str) -> Interrupt {
        Interrupt::new(
            signals::emergency_stop(),
            AgentId::try_new(target.to_string()).unwrap(),
            Bytes::from_static(b"halt"),
            AgentId::try_new("operator".to_string()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_should_walk_full_lifecycle_when_interrupt_delivered_and_acked() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let id = store.enqueue(&interrupt_for("alpha"), 50).await.unwrap();

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].state, InterruptState::Pending);
        assert_eq!(pending[0].retry_count, 0);
        assert_eq!(pending[0].max_retries, 50);

        store.mark_delivered(id, Timestamp::now()).await.unwrap();
        store.acknowledge(id, Timestamp::now()).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.state, InterruptState::Acknowledged);
        assert!(row.delivered_at.is_some());
        assert!(row.ack_at.is_some());
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_should_track_retry_count_when_attempts_fail() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.enqueue(&interrupt_for("alpha"), 3).await.unwrap();

        assert_eq!(store.increment_retry(id, "buffer full").await.unwrap(), 1);
        assert_eq!(store.increment_retry(id, "buffer full").await.unwrap(), 2);
        assert_eq!(store.increment_retry(id, "no handler").await.unwrap(), 3);

        store.mark_failed(id, "no handler").await.unwrap();
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.state, InterruptState::Failed);
        assert_eq!(row.error.as_deref(), Some("no handler"));
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_should_reject_acknowledge_when_interrupt_still_pending() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let id = store.enqueue(&interrupt_for("alpha"), 50).await.unwrap();

        match store.acknowledge(id, Timestamp::now()).await.unwrap_err() {
            StoreError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "pending");
                assert_eq!(to, "acknowledged");
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_collect_only_acknowledged_rows_when_clearing_old() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let acked = store.enqueue(&interrupt_for("alpha"), 50).await.unwrap();
        store.mark_delivered(acked, Timestamp::now()).await.unwrap();
        store.acknowledge(acked, Timestamp::now()).await.unwrap();

        let pending = store.enqueue(&interrupt_for("beta"), 50).await.unwrap();

        let cutoff = Timestamp::now().plus(std::time::Duration::from_secs(1));
        let removed = store.clear_old(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(acked).await.unwrap().is_none());
        assert!(store.get(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_should_count_pending_rows_when_filtered_by_signal_and_target() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let alpha = AgentId::try_new("alpha".to_string()).unwrap();

        store.enqueue(&interrupt_for("alpha"), 50).await.unwrap();
        store.enqueue(&interrupt_for("beta"), 50).await.unwrap();

        let count = store
            .pending_count_for(signals::emergency_stop(), &alpha)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
