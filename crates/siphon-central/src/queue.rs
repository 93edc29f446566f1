//! Central Queue: durable FIFO of serialized tasks, addressed by queue name.
//!
//! The [`TaskQueue`] trait is the whole contract the rest of the daemon
//! relies on: push, blocking pop with a timeout, and length. [`SqliteQueue`]
//! implements it on an embedded SQLite table so queued work survives a
//! restart.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use siphon_core::UploadTask;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Current queue schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Upper bound on how long a blocked pop sleeps before looking again.
///
/// Pushes wake waiters directly. The re-poll covers writers in other
/// processes sharing the database file.
const REPOLL_INTERVAL: Duration = Duration::from_millis(500);

/// A durable FIFO keyed by queue name.
///
/// Ordering holds within a queue name only.
pub trait TaskQueue: Send + Sync + 'static {
    /// Append `payload` to `queue`. Never blocks on consumers.
    fn push(&self, queue: &str, payload: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove and return the oldest payload of `queue`.
    ///
    /// Waits up to `timeout` for one to arrive; `Duration::ZERO` waits
    /// indefinitely. Returns `None` on timeout.
    fn pop(&self, queue: &str, timeout: Duration)
    -> impl Future<Output = Result<Option<String>>> + Send;

    /// Number of payloads waiting in `queue`.
    fn len(&self, queue: &str) -> impl Future<Output = Result<u64>> + Send;
}

/// [`TaskQueue`] stored in a SQLite `queue_items` table.
///
/// Pushes and length queries run on the blocking pool. A pop deletes the
/// row and returns it without an await in between, so dropping a pending
/// pop never loses a task.
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    notify: Notify,
}

impl SqliteQueue {
    /// Open or create the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;
        Self::from_connection(conn)
    }

    /// Open an in-memory queue (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Notify::new(),
        })
    }

    /// Pop the oldest item without waiting.
    pub fn try_pop(&self, queue: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let head: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, payload FROM queue_items WHERE queue = ? ORDER BY id LIMIT 1",
                [queue],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, payload)) = head else {
            return Ok(None);
        };

        tx.execute("DELETE FROM queue_items WHERE id = ?", [id])?;
        tx.commit()?;

        siphon_core::metrics::increment("queue_tasks_popped_total", 1);
        Ok(Some(payload))
    }

    /// Synchronous [`TaskQueue::len`].
    pub fn depth(&self, queue: &str) -> Result<u64> {
        count_items(&self.conn, queue)
    }
}

fn insert_item(conn: &Mutex<Connection>, queue: &str, payload: &str) -> Result<()> {
    let conn = conn.lock();
    conn.execute(
        "INSERT INTO queue_items (queue, payload, enqueued_at) VALUES (?, ?, ?)",
        params![queue, payload, chrono::Utc::now().timestamp()],
    )?;
    Ok(())
}

fn count_items(conn: &Mutex<Connection>, queue: &str) -> Result<u64> {
    let conn = conn.lock();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_items WHERE queue = ?",
        [queue],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

impl TaskQueue for SqliteQueue {
    async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let queue = queue.to_string();
        let payload = payload.to_string();
        tokio::task::spawn_blocking(move || insert_item(&conn, &queue, &payload)).await??;
        siphon_core::metrics::increment("queue_tasks_pushed_total", 1);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            // register interest before looking so a push in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(queue)? {
                return Ok(Some(payload));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(REPOLL_INTERVAL)
                }
                None => REPOLL_INTERVAL,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        let conn = Arc::clone(&self.conn);
        let queue = queue.to_string();
        tokio::task::spawn_blocking(move || count_items(&conn, &queue)).await?
    }
}

/// Serialize `task` and push it onto `queue`.
pub async fn enqueue_task<Q: TaskQueue>(q: &Q, queue: &str, task: &UploadTask) -> Result<()> {
    let payload = task.to_json()?;
    q.push(queue, &payload).await
}

/// Pop the next decodable task from `queue`.
///
/// Payloads that no longer decode are logged and discarded; they can never
/// become valid by waiting.
pub async fn dequeue_task<Q: TaskQueue>(
    q: &Q,
    queue: &str,
    timeout: Duration,
) -> Result<Option<UploadTask>> {
    loop {
        let Some(payload) = q.pop(queue, timeout).await? else {
            return Ok(None);
        };
        match UploadTask::from_json(&payload) {
            Ok(task) => return Ok(Some(task)),
            Err(e) => {
                tracing::error!(queue, error = %e, "discarding undecodable queue payload");
            }
        }
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let current: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    match current {
        None => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS queue_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_queue_items_queue ON queue_items(queue, id);
                "#,
            )?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                [SCHEMA_VERSION],
            )?;
        }
        Some(found) if found > SCHEMA_VERSION => {
            return Err(Error::SchemaTooNew {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        Some(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use siphon_core::{IngestRecord, SourceType};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fifo_within_queue_name() {
        let q = SqliteQueue::open_in_memory().unwrap();
        q.push("ingest", "a").await.unwrap();
        q.push("other", "x").await.unwrap();
        q.push("ingest", "b").await.unwrap();

        assert_eq!(q.len("ingest").await.unwrap(), 2);
        assert_eq!(q.try_pop("ingest").unwrap().as_deref(), Some("a"));
        assert_eq!(q.try_pop("ingest").unwrap().as_deref(), Some("b"));
        assert_eq!(q.try_pop("ingest").unwrap(), None);
        assert_eq!(q.len("other").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_pushes_all_land() {
        let q = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                q.push("ingest", &format!("task-{}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(q.len("ingest").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_pop_times_out_with_none() {
        let q = SqliteQueue::open_in_memory().unwrap();
        let started = Instant::now();
        let popped = q.pop("ingest", Duration::from_millis(50)).await.unwrap();
        assert_eq!(popped, None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocked_pop_is_woken_by_push() {
        let q = Arc::new(SqliteQueue::open_in_memory().unwrap());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop("ingest", Duration::ZERO).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push("ingest", "late").await.unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("queue.db");
        {
            let q = SqliteQueue::open(&path).unwrap();
            q.push("ingest", "durable").await.unwrap();
        }
        let q = SqliteQueue::open(&path).unwrap();
        assert_eq!(q.len("ingest").await.unwrap(), 1);
        assert_eq!(q.try_pop("ingest").unwrap().as_deref(), Some("durable"));
    }

    #[tokio::test]
    async fn test_task_helpers_skip_garbage() {
        let q = SqliteQueue::open_in_memory().unwrap();
        let st = SourceType::new("botnet_a").unwrap();
        let task = UploadTask::new(
            st.clone(),
            vec![IngestRecord::new(st, "10.0.0.1", "beacon", Utc::now())],
            "edge-1",
        );

        q.push("ingest", "{not json").await.unwrap();
        enqueue_task(&q, "ingest", &task).await.unwrap();

        let popped = dequeue_task(&q, "ingest", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, task);
        assert_eq!(q.len("ingest").await.unwrap(), 0);
    }
}
