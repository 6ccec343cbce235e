//! The durable "to-download" queue.
//!
//! Admission publishes one message per new granule; the download worker
//! consumes them. Messages claimed by a worker stay invisible for a
//! visibility timeout and reappear if never deleted, so a killed worker
//! costs redelivery rather than loss. Duplicates are tolerated by the
//! admission and lease invariants on the granule row.

mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::sqlite_persistence::open_database;
use schema::QUEUE_DB_VERSIONED_SCHEMAS;

/// Default broker visibility timeout in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: i64 = 900;

/// The opaque message payload handed to the download worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMessage {
    pub id: String,
    pub download_url: String,
}

/// A message leased from the queue, deletable through its receipt.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub receipt: String,
    pub message: DownloadMessage,
}

/// Durable queue operations, broker-shaped: fire-and-forget publish,
/// visibility-timeout receive, explicit delete.
pub trait DownloadQueue: Send + Sync {
    fn publish(&self, message: &DownloadMessage) -> Result<()>;

    /// Lease the oldest visible message for `visibility_timeout_secs`.
    fn receive(&self, visibility_timeout_secs: i64) -> Result<Option<ReceivedMessage>>;

    /// Delete a leased message. Unknown receipts (already deleted, or the
    /// lease expired and another worker holds the message) are a no-op.
    fn delete(&self, receipt: &str) -> Result<()>;

    /// Number of currently visible messages.
    fn visible_len(&self) -> Result<usize>;
}

/// SQLite-backed download queue (queue.db).
pub struct SqliteDownloadQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDownloadQueue {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_database(db_path.as_ref(), QUEUE_DB_VERSIONED_SCHEMAS)?;
        Ok(SqliteDownloadQueue {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory queue for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        QUEUE_DB_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(SqliteDownloadQueue {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

impl DownloadQueue for SqliteDownloadQueue {
    fn publish(&self, message: &DownloadMessage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let body = serde_json::to_string(message)?;
        conn.execute(
            r#"INSERT INTO queue_message (body, visible_at, receive_count)
               VALUES (?1, ?2, 0)"#,
            rusqlite::params![body, Self::now()],
        )?;
        Ok(())
    }

    fn receive(&self, visibility_timeout_secs: i64) -> Result<Option<ReceivedMessage>> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();

        let next: Option<(i64, String)> = conn
            .prepare(
                r#"SELECT id, body FROM queue_message
                   WHERE visible_at <= ?1
                   ORDER BY id LIMIT 1"#,
            )?
            .query_row([now], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((id, body)) = next else {
            return Ok(None);
        };

        let receipt = Uuid::new_v4().to_string();
        let claimed = conn.execute(
            r#"UPDATE queue_message
               SET visible_at = ?1, receipt = ?2, receive_count = receive_count + 1
               WHERE id = ?3 AND visible_at <= ?4"#,
            rusqlite::params![now + visibility_timeout_secs, receipt, id, now],
        )?;
        if claimed == 0 {
            return Ok(None);
        }

        let message: DownloadMessage = serde_json::from_str(&body)
            .with_context(|| format!("Malformed queue message body: {}", body))?;

        Ok(Some(ReceivedMessage { receipt, message }))
    }

    fn delete(&self, receipt: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM queue_message WHERE receipt = ?1", [receipt])?;
        Ok(())
    }

    fn visible_len(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_message WHERE visible_at <= ?1",
            [Self::now()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> DownloadMessage {
        DownloadMessage {
            id: id.to_string(),
            download_url: format!("https://zipper.example.com/odata/v1/Products({id})/$value"),
        }
    }

    #[test]
    fn test_publish_and_receive() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();

        let received = queue.receive(900).unwrap().unwrap();
        assert_eq!(received.message, message("g1"));
    }

    #[test]
    fn test_receive_empty_queue() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        assert!(queue.receive(900).unwrap().is_none());
    }

    #[test]
    fn test_received_message_is_invisible_until_timeout() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();

        assert!(queue.receive(900).unwrap().is_some());
        assert!(queue.receive(900).unwrap().is_none());
        assert_eq!(queue.visible_len().unwrap(), 0);
    }

    #[test]
    fn test_message_reappears_after_visibility_timeout() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();

        // A zero timeout leaves the message immediately visible again
        assert!(queue.receive(0).unwrap().is_some());
        assert!(queue.receive(900).unwrap().is_some());
    }

    #[test]
    fn test_delete_consumes_message() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();

        let received = queue.receive(0).unwrap().unwrap();
        queue.delete(&received.receipt).unwrap();
        assert!(queue.receive(900).unwrap().is_none());
        assert_eq!(queue.visible_len().unwrap(), 0);
    }

    #[test]
    fn test_delete_unknown_receipt_is_noop() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();
        queue.delete("not-a-receipt").unwrap();
        assert_eq!(queue.visible_len().unwrap(), 1);
    }

    #[test]
    fn test_messages_are_received_oldest_first() {
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();
        queue.publish(&message("g2")).unwrap();

        assert_eq!(queue.receive(900).unwrap().unwrap().message.id, "g1");
        assert_eq!(queue.receive(900).unwrap().unwrap().message.id, "g2");
    }

    #[test]
    fn test_duplicate_publishes_are_kept() {
        // The queue itself does not deduplicate; the downloader's lease and
        // downloaded checks make duplicates harmless
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        queue.publish(&message("g1")).unwrap();
        queue.publish(&message("g1")).unwrap();
        assert_eq!(queue.visible_len().unwrap(), 2);
    }
}
