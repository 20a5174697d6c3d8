use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::error::{StoryError, StoryResult};
use crate::core::tasks::TaskMessage;

/// One leased message. It stays invisible to other consumers until acked,
/// nacked, or the lease runs out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub body: String,
    pub attempts: i64,
    lease_token: String,
}

impl Delivery {
    pub fn task_message(&self) -> StoryResult<TaskMessage> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Durable at-least-once queue of task ids.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, task_id: &str) -> StoryResult<()>;

    /// Lease the oldest visible message, if any. Does not block.
    async fn receive(&self, lease: Duration) -> StoryResult<Option<Delivery>>;

    /// Remove a fully processed message.
    async fn ack(&self, delivery: &Delivery) -> StoryResult<()>;

    /// Return a message for immediate redelivery.
    async fn nack(&self, delivery: &Delivery) -> StoryResult<()>;
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Queue table kept in the document store's database.
pub struct SqliteTaskQueue {
    db: Arc<Mutex<Connection>>,
    name: String,
}

impl SqliteTaskQueue {
    pub async fn new(db: Arc<Mutex<Connection>>, name: &str) -> StoryResult<Self> {
        let queue = Self {
            db,
            name: name.to_string(),
        };
        queue.initialize().await?;
        Ok(queue)
    }

    async fn initialize(&self) -> StoryResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS task_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                visible_at INTEGER NOT NULL,
                lease_token TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_queue_visible ON task_queue(queue, visible_at, id)",
            [],
        )?;
        Ok(())
    }

    pub async fn depth(&self) -> StoryResult<i64> {
        let db = self.db.lock().await;
        let count = db.query_row(
            "SELECT COUNT(*) FROM task_queue WHERE queue = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn publish(&self, task_id: &str) -> StoryResult<()> {
        let body = serde_json::to_string(&TaskMessage {
            task_id: task_id.to_string(),
        })?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO task_queue (queue, body, visible_at) VALUES (?1, ?2, ?3)",
            params![self.name, body, now_ms()],
        )
        .map_err(|e| StoryError::QueueUnavailable(e.to_string()))?;
        debug!("Published task {} to queue {}", task_id, self.name);
        Ok(())
    }

    async fn receive(&self, lease: Duration) -> StoryResult<Option<Delivery>> {
        let now = now_ms();
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let next: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT id, body, attempts FROM task_queue
                 WHERE queue = ?1 AND visible_at <= ?2 ORDER BY visible_at ASC, id ASC LIMIT 1",
                params![self.name, now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, body, attempts)) = next else {
            return Ok(None);
        };
        let lease_token = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "UPDATE task_queue SET attempts = attempts + 1, visible_at = ?1, lease_token = ?2 WHERE id = ?3",
            params![now + lease.as_millis() as i64, lease_token, id],
        )?;
        tx.commit()?;
        Ok(Some(Delivery {
            id,
            body,
            attempts: attempts + 1,
            lease_token,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> StoryResult<()> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM task_queue WHERE id = ?1 AND lease_token = ?2",
            params![delivery.id, delivery.lease_token],
        )?;
        if rows == 0 {
            debug!("Ack for message {} arrived after its lease moved on", delivery.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> StoryResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE task_queue SET visible_at = ?1, lease_token = NULL WHERE id = ?2 AND lease_token = ?3",
            params![now_ms(), delivery.id, delivery.lease_token],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue(name: &str) -> SqliteTaskQueue {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        SqliteTaskQueue::new(db, name).await.unwrap()
    }

    #[tokio::test]
    async fn messages_come_out_in_publish_order() {
        let q = queue("agent_tasks").await;
        q.publish("t1").await.unwrap();
        q.publish("t2").await.unwrap();
        let first = q.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        let second = q.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.task_message().unwrap().task_id, "t1");
        assert_eq!(second.task_message().unwrap().task_id, "t2");
        assert!(q.receive(Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn body_is_task_id_json() {
        let q = queue("agent_tasks").await;
        q.publish("abc").await.unwrap();
        let delivery = q.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(delivery.body, r#"{"task_id":"abc"}"#);
    }

    #[tokio::test]
    async fn ack_removes_and_nack_redelivers() {
        let q = queue("agent_tasks").await;
        q.publish("t1").await.unwrap();
        let delivery = q.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        q.nack(&delivery).await.unwrap();

        let again = q.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
        assert_eq!(again.attempts, 2);

        q.ack(&again).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_stale_ack_ignored() {
        let q = queue("agent_tasks").await;
        q.publish("t1").await.unwrap();
        let first = q.receive(Duration::ZERO).await.unwrap().unwrap();
        let second = q.receive(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);

        q.ack(&first).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 1);
        q.ack(&second).await.unwrap();
        assert_eq!(q.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn named_queues_are_isolated() {
        let db = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let a = SqliteTaskQueue::new(db.clone(), "a").await.unwrap();
        let b = SqliteTaskQueue::new(db, "b").await.unwrap();
        a.publish("t1").await.unwrap();
        assert!(b.receive(Duration::from_secs(1)).await.unwrap().is_none());
        assert!(a.receive(Duration::from_secs(1)).await.unwrap().is_some());
    }
}
