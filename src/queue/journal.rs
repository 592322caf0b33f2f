//! SQLite journal that lets queued jobs outlive the process.
//!
//! Only unfinished jobs are kept: a row is inserted on enqueue, its state columns follow every
//! transition, and it is deleted once the job completes or fails.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;

use super::{JobPayload, JobState, QueueError, QueueName, QueuedJob};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    queue TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    ready_at_ms INTEGER,
    enqueued_at_ms INTEGER NOT NULL,
    last_error TEXT,
    payload TEXT NOT NULL
)
"#;

/// A journalled job as read back at startup.
pub(super) struct JournalRow {
    pub job: QueuedJob,
    /// Wall-clock time a delayed job becomes ready, in Unix milliseconds.
    pub ready_at_ms: Option<i64>,
}

/// Handle to the `queue_jobs` table.
#[derive(Clone)]
pub(super) struct QueueJournal {
    pool: SqlitePool,
}

impl QueueJournal {
    /// Journal held in a private in-memory database.
    pub fn in_memory() -> Self {
        Self::lazy(SqliteConnectOptions::new().filename(":memory:"))
    }

    /// Journal stored at `url` (for example `sqlite://queue.db`), created on first use.
    pub fn connect(url: &str) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        Ok(Self::lazy(options))
    }

    // One connection: callers already serialize access, and an in-memory database lives
    // exactly as long as its connection.
    fn lazy(options: SqliteConnectOptions) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options);
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert(&self, job: &QueuedJob, ready_at_ms: Option<i64>) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job.payload.as_ref())?;
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, state, attempts, ready_at_ms, enqueued_at_ms, last_error, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&job.id)
        .bind(job.queue.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts_made))
        .bind(ready_at_ms)
        .bind(unix_ms(job.enqueued_at))
        .bind(job.last_error.as_deref())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the mutable columns of `job`.
    pub async fn update(&self, job: &QueuedJob, ready_at_ms: Option<i64>) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = ?2, attempts = ?3, ready_at_ms = ?4, last_error = ?5
            WHERE id = ?1
            "#,
        )
        .bind(&job.id)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts_made))
        .bind(ready_at_ms)
        .bind(job.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every journalled job in enqueue order. Unreadable rows are dropped with a warning.
    pub async fn load(&self) -> Result<Vec<JournalRow>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, queue, state, attempts, ready_at_ms, enqueued_at_ms, last_error, payload
            FROM queue_jobs ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            match decode_row(&row) {
                Ok(decoded) => jobs.push(decoded),
                Err(reason) => {
                    tracing::warn!(job_id = %id, reason = %reason, "Dropping unreadable queue row");
                    self.remove(&id).await?;
                }
            }
        }
        Ok(jobs)
    }

    /// Rows currently journalled.
    pub async fn count(&self) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM queue_jobs")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<JournalRow, String> {
    let id: String = row.try_get("id").map_err(|error| error.to_string())?;
    let queue: String = row.try_get("queue").map_err(|error| error.to_string())?;
    let state: String = row.try_get("state").map_err(|error| error.to_string())?;
    let attempts: i64 = row.try_get("attempts").map_err(|error| error.to_string())?;
    let ready_at_ms: Option<i64> = row.try_get("ready_at_ms").map_err(|error| error.to_string())?;
    let enqueued_at_ms: i64 = row
        .try_get("enqueued_at_ms")
        .map_err(|error| error.to_string())?;
    let last_error: Option<String> = row.try_get("last_error").map_err(|error| error.to_string())?;
    let payload: String = row.try_get("payload").map_err(|error| error.to_string())?;

    let queue = QueueName::from_wire(&queue).ok_or_else(|| format!("unknown queue '{queue}'"))?;
    let state = JobState::from_wire(&state).ok_or_else(|| format!("unknown state '{state}'"))?;
    let payload: JobPayload = serde_json::from_str(&payload).map_err(|error| error.to_string())?;
    if payload.queue() != queue {
        return Err(format!("payload belongs on '{}'", payload.queue()));
    }
    let enqueued_at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(enqueued_at_ms) * 1_000_000)
        .map_err(|error| error.to_string())?;

    Ok(JournalRow {
        job: QueuedJob {
            id,
            queue,
            payload: Arc::new(payload),
            attempts_made: u32::try_from(attempts).unwrap_or_default(),
            state,
            enqueued_at,
            last_error,
        },
        ready_at_ms,
    })
}

/// `at` as Unix milliseconds.
pub(super) fn unix_ms(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
