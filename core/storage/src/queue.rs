//! Durable, ordered queue of mutations waiting to reach the backend.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use offgrid_common::{Error, Result};

use crate::database::{now_millis, Database};

/// A mutation captured locally and not yet confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Assigned on enqueue; strictly increasing and never reused.
    pub id: i64,
    /// Application-defined mutation type (e.g. `checkin`).
    pub kind: String,
    /// Opaque payload, interpreted only by the replay handler.
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed replay attempts.
    pub retries: u32,
}

impl PendingMutation {
    /// Decode a JSON payload.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Serialization(format!("mutation {} payload: {}", self.id, e)))
    }

    /// Payload as UTF-8 text, if it is.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

type RawMutation = (i64, String, Vec<u8>, i64, i64);

fn read_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMutation> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

impl From<RawMutation> for PendingMutation {
    fn from((id, kind, payload, enqueued_at, retries): RawMutation) -> Self {
        Self {
            id,
            kind,
            payload,
            enqueued_at: DateTime::<Utc>::from_timestamp_millis(enqueued_at).unwrap_or_default(),
            retries: u32::try_from(retries).unwrap_or(u32::MAX),
        }
    }
}

/// Append-only log of pending mutations, replayed in id order.
#[derive(Clone)]
pub struct MutationQueue {
    db: Arc<Database>,
}

impl MutationQueue {
    /// Open the queue, creating its table if missing.
    pub async fn open(db: Arc<Database>) -> Result<Self> {
        db.call("create queue", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS pending_mutations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    retries INTEGER NOT NULL DEFAULT 0
                );
                "#,
            )
        })
        .await?;

        Ok(Self { db })
    }

    /// Append a mutation with zero retries and return its id.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the medium cannot be written
    pub async fn enqueue(&self, kind: &str, payload: impl Into<Vec<u8>>) -> Result<i64> {
        let payload = payload.into();
        let enqueued_at = now_millis();

        let id = self
            .db
            .call("enqueue", |conn| {
                conn.execute(
                    "INSERT INTO pending_mutations (kind, payload, enqueued_at, retries) VALUES (?1, ?2, ?3, 0)",
                    params![kind, payload, enqueued_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!("Enqueued mutation {} ({})", id, kind);
        Ok(id)
    }

    /// Append a mutation with a JSON-encoded payload.
    pub async fn enqueue_json<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<i64> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue(kind, bytes).await
    }

    /// All pending mutations in enqueue order.
    pub async fn list(&self) -> Result<Vec<PendingMutation>> {
        let rows = self
            .db
            .call("list mutations", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, payload, enqueued_at, retries FROM pending_mutations ORDER BY id ASC",
                )?;
                let rows = stmt.query_map([], read_mutation)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        Ok(rows.into_iter().map(PendingMutation::from).collect())
    }

    /// Get a single mutation.
    pub async fn get(&self, id: i64) -> Result<Option<PendingMutation>> {
        let row = self
            .db
            .call("get mutation", |conn| {
                conn.query_row(
                    "SELECT id, kind, payload, enqueued_at, retries FROM pending_mutations WHERE id = ?1",
                    [id],
                    read_mutation,
                )
                .optional()
            })
            .await?;

        Ok(row.map(PendingMutation::from))
    }

    /// Remove a mutation. Removing a missing id succeeds.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, id: i64) -> Result<bool> {
        let removed = self
            .db
            .call("remove mutation", |conn| {
                conn.execute("DELETE FROM pending_mutations WHERE id = ?1", [id])
            })
            .await?;

        debug!("Removed mutation {} ({} rows)", id, removed);
        Ok(removed > 0)
    }

    /// Bump the retry counter in place.
    ///
    /// Returns the new count, or `None` if the mutation no longer exists.
    pub async fn increment_retries(&self, id: i64) -> Result<Option<u32>> {
        let retries: Option<i64> = self
            .db
            .call("increment retries", |conn| {
                conn.query_row(
                    "UPDATE pending_mutations SET retries = retries + 1 WHERE id = ?1 RETURNING retries",
                    [id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        Ok(retries.map(|r| u32::try_from(r).unwrap_or(u32::MAX)))
    }

    /// Number of pending mutations.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = self
            .db
            .call("count mutations", |conn| {
                conn.query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))
            })
            .await?;
        Ok(count as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop every pending mutation.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self
            .db
            .call("clear mutations", |conn| {
                conn.execute("DELETE FROM pending_mutations", [])
            })
            .await?;
        info!("Cleared {} pending mutations", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn queue() -> MutationQueue {
        MutationQueue::open(Arc::new(Database::in_memory().unwrap()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_increasing_ids() {
        let queue = queue().await;
        let a = queue.enqueue("checkin", b"a".to_vec()).await.unwrap();
        let b = queue.enqueue("checkin", b"b".to_vec()).await.unwrap();
        assert_eq!(a, 1);
        assert!(b > a);

        let first = queue.get(a).await.unwrap().unwrap();
        assert_eq!(first.retries, 0);
        assert_eq!(first.payload_str(), Some("a"));
    }

    #[tokio::test]
    async fn test_list_preserves_order() {
        let queue = queue().await;
        for kind in ["A", "B", "C"] {
            queue.enqueue(kind, Vec::new()).await.unwrap();
        }

        let kinds: Vec<_> = queue.list().await.unwrap().into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec!["A", "B", "C"]);
        assert_eq!(queue.list().await.unwrap(), queue.list().await.unwrap());
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_remove() {
        let queue = queue().await;
        let a = queue.enqueue("x", Vec::new()).await.unwrap();
        let b = queue.enqueue("x", Vec::new()).await.unwrap();
        queue.remove(b).await.unwrap();
        let c = queue.enqueue("x", Vec::new()).await.unwrap();
        assert!(c > b && b > a);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let queue = queue().await;
        let id = queue.enqueue("x", Vec::new()).await.unwrap();
        assert!(queue.remove(id).await.unwrap());
        assert!(!queue.remove(id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_retries() {
        let queue = queue().await;
        let id = queue.enqueue("x", Vec::new()).await.unwrap();

        assert_eq!(queue.increment_retries(id).await.unwrap(), Some(1));
        assert_eq!(queue.increment_retries(id).await.unwrap(), Some(2));
        assert_eq!(queue.get(id).await.unwrap().unwrap().retries, 2);
        assert_eq!(queue.len().await.unwrap(), 1);

        queue.remove(id).await.unwrap();
        assert_eq!(queue.increment_retries(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_payload() {
        let queue = queue().await;
        let id = queue
            .enqueue_json("checkin", &json!({ "spotId": 42 }))
            .await
            .unwrap();

        let mutation = queue.get(id).await.unwrap().unwrap();
        let payload: serde_json::Value = mutation.payload_json().unwrap();
        assert_eq!(payload["spotId"], 42);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.db");

        {
            let queue = MutationQueue::open(Arc::new(Database::open(&path).unwrap()))
                .await
                .unwrap();
            let id = queue.enqueue("checkin", b"{}".to_vec()).await.unwrap();
            queue.increment_retries(id).await.unwrap();
        }

        let queue = MutationQueue::open(Arc::new(Database::open(&path).unwrap()))
            .await
            .unwrap();
        let pending = queue.list().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retries, 1);
        assert_eq!(pending[0].kind, "checkin");
    }
}
