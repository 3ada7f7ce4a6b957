//! Persistent FIFO job queue (C4), backed by SQLite.
//!
//! Schema and connection setup mirror the link-index's `SqliteConnectOptions`
//! WAL pattern; crash-recovery semantics (`requeue_processing`) follow the
//! queue's `requeue_processing` / `recover_from_crash` behavior: anything
//! left `processing` when the process last exited is not lost, it goes back
//! to the head of the line.

use crate::model::{QueueEntry, QueueEntryStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    options TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_queue_status ON audit_queue(status);
CREATE INDEX IF NOT EXISTS idx_audit_queue_created_at ON audit_queue(created_at);
"#;

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<QueueEntry> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "pending" => QueueEntryStatus::Pending,
        "processing" => QueueEntryStatus::Processing,
        "cancelled" => QueueEntryStatus::Cancelled,
        other => anyhow::bail!("unknown queue entry status {other:?}"),
    };
    let options_raw: String = row.get("options");
    let created_at_raw: String = row.get("created_at");

    Ok(QueueEntry {
        id: row.get("id"),
        job_id: row.get("job_id"),
        url: row.get("url"),
        options: serde_json::from_str(&options_raw).context("corrupt queue options payload")?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .context("corrupt queue timestamp")?
            .with_timezone(&Utc),
        status,
    })
}

/// Durable FIFO of audits waiting for a concurrency slot. Survives process
/// restarts; anything still `processing` at startup is assumed abandoned by
/// the previous process and requeued.
pub struct JobQueue {
    pool: SqlitePool,
    max_queue_size: usize,
}

impl JobQueue {
    pub async fn open(db_path: &Path, max_queue_size: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create queue directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open queue database")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to initialize queue schema")?;

        let queue = Self { pool, max_queue_size };
        queue.requeue_processing().await?;
        Ok(queue)
    }

    /// Appends a pending entry, counting the current pending backlog and the
    /// insert in the same transaction so a burst of concurrent submissions
    /// can't all squeeze past the cap. Returns `Ok(None)` once
    /// `max_queue_size` pending entries are already queued, per the
    /// `|queue_pending| <= max_queue_size` invariant.
    pub async fn enqueue(&self, job_id: &str, url: &str, options: &serde_json::Value) -> Result<Option<i64>> {
        let options_json = serde_json::to_string(options).context("failed to serialize queue options")?;

        let mut tx = self.pool.begin().await.context("failed to begin enqueue transaction")?;

        let (pending_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_queue WHERE status = 'pending'")
            .fetch_one(&mut *tx)
            .await
            .context("failed to count pending queue entries")?;

        if pending_count as usize >= self.max_queue_size {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let result = sqlx::query(
            "INSERT INTO audit_queue (job_id, url, options, created_at, status) VALUES (?, ?, ?, ?, 'pending')",
        )
        .bind(job_id)
        .bind(url)
        .bind(options_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("failed to enqueue job")?;

        tx.commit().await.context("failed to commit enqueue transaction")?;

        Ok(Some(result.last_insert_rowid()))
    }

    /// Pops the oldest pending entry and marks it `processing`, atomically.
    pub async fn dequeue(&self) -> Result<Option<QueueEntry>> {
        let mut tx = self.pool.begin().await.context("failed to begin dequeue transaction")?;

        let row = sqlx::query(
            "SELECT id, job_id, url, options, created_at, status FROM audit_queue \
             WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .context("failed to query next queue entry")?;

        let Some(row) = row else {
            tx.commit().await.ok();
            return Ok(None);
        };

        let entry = row_to_entry(&row)?;

        sqlx::query("UPDATE audit_queue SET status = 'processing' WHERE id = ?")
            .bind(entry.id)
            .execute(&mut *tx)
            .await
            .context("failed to mark queue entry processing")?;

        tx.commit().await.context("failed to commit dequeue transaction")?;

        Ok(Some(QueueEntry {
            status: QueueEntryStatus::Processing,
            ..entry
        }))
    }

    /// Removes a finished entry entirely (success or terminal failure).
    pub async fn remove(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM audit_queue WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to remove queue entry")?;
        Ok(())
    }

    /// Marks a pending entry as cancelled without removing it, so a racing
    /// dequeue doesn't pick it up; the caller deletes it afterward.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE audit_queue SET status = 'cancelled' WHERE job_id = ? AND status = 'pending'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("failed to cancel queue entry")?;
        Ok(result.rows_affected() > 0)
    }

    /// 1-based position among pending entries, `None` if not pending.
    pub async fn position(&self, job_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM audit_queue b \
              WHERE b.status = 'pending' AND \
                    (b.created_at < a.created_at OR (b.created_at = a.created_at AND b.id <= a.id))) AS position \
             FROM audit_queue a WHERE a.job_id = ? AND a.status = 'pending'",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to compute queue position")?;

        Ok(row.map(|r| r.get::<i64, _>("position")))
    }

    pub async fn size(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_queue WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .context("failed to count queue size")?;
        Ok(row.0)
    }

    /// Resets anything left `processing` back to `pending`, at the head of
    /// the queue (by leaving `created_at` untouched, FIFO order is
    /// preserved). Called once at startup to recover from an unclean exit.
    async fn requeue_processing(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE audit_queue SET status = 'pending' WHERE status = 'processing'")
            .execute(&self.pool)
            .await
            .context("failed to requeue processing entries")?;
        Ok(result.rows_affected())
    }

    /// Deletes entries cancelled more than `older_than_seconds` ago, so the
    /// table doesn't accumulate tombstones forever.
    pub async fn cleanup_stale(&self, older_than_seconds: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(older_than_seconds);
        let result = sqlx::query("DELETE FROM audit_queue WHERE status = 'cancelled' AND created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .context("failed to clean up stale queue entries")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_queue() -> (TempDir, JobQueue) {
        open_queue_with_cap(50).await
    }

    async fn open_queue_with_cap(max_queue_size: usize) -> (TempDir, JobQueue) {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("queue.db");
        let queue = JobQueue::open(&db_path, max_queue_size).await.expect("open queue");
        (dir, queue)
    }

    #[tokio::test]
    async fn fifo_dequeue_order() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("job-1", "https://a.example/", &json!({})).await.unwrap();
        queue.enqueue("job-2", "https://b.example/", &json!({})).await.unwrap();

        let first = queue.dequeue().await.unwrap().expect("entry");
        assert_eq!(first.job_id, "job-1");
        let second = queue.dequeue().await.unwrap().expect("entry");
        assert_eq!(second.job_id, "job-2");
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn position_reflects_fifo_rank() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("job-1", "https://a.example/", &json!({})).await.unwrap();
        queue.enqueue("job-2", "https://b.example/", &json!({})).await.unwrap();

        assert_eq!(queue.position("job-1").await.unwrap(), Some(1));
        assert_eq!(queue.position("job-2").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn cancel_removes_from_pending_position() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("job-1", "https://a.example/", &json!({})).await.unwrap();
        queue.enqueue("job-2", "https://b.example/", &json!({})).await.unwrap();

        assert!(queue.cancel("job-1").await.unwrap());
        assert_eq!(queue.position("job-1").await.unwrap(), None);
        assert_eq!(queue.position("job-2").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn crash_recovery_requeues_processing_entries() {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("queue.db");

        {
            let queue = JobQueue::open(&db_path, 50).await.expect("open queue");
            queue.enqueue("job-1", "https://a.example/", &json!({})).await.unwrap();
            let entry = queue.dequeue().await.unwrap().expect("entry");
            assert_eq!(entry.status, QueueEntryStatus::Processing);
        }

        let reopened = JobQueue::open(&db_path, 50).await.expect("reopen queue");
        assert_eq!(reopened.size().await.unwrap(), 1);
        let entry = reopened.dequeue().await.unwrap().expect("requeued entry");
        assert_eq!(entry.job_id, "job-1");
    }

    #[tokio::test]
    async fn enqueue_returns_none_once_pending_backlog_hits_the_cap() {
        let (_dir, queue) = open_queue_with_cap(2).await;
        assert!(queue.enqueue("job-1", "https://a.example/", &json!({})).await.unwrap().is_some());
        assert!(queue.enqueue("job-2", "https://b.example/", &json!({})).await.unwrap().is_some());
        assert!(queue.enqueue("job-3", "https://c.example/", &json!({})).await.unwrap().is_none());
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cleanup_stale_removes_old_cancelled_entries_only() {
        let (_dir, queue) = open_queue().await;
        queue.enqueue("job-1", "https://a.example/", &json!({})).await.unwrap();
        queue.enqueue("job-2", "https://b.example/", &json!({})).await.unwrap();
        queue.cancel("job-1").await.unwrap();

        assert_eq!(queue.cleanup_stale(3600).await.unwrap(), 0);
        assert_eq!(queue.cleanup_stale(-1).await.unwrap(), 1);
        assert_eq!(queue.position("job-2").await.unwrap(), Some(1));
    }
}
