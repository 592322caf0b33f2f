//! Job lifecycle overlay: status, progress, and error per document.
//!
//! Records live in the KV backend under `ingestion:status:{document_id}` with a TTL. Every write
//! is a compare-and-swap loop over the serialized record, and the status machine only moves
//! forward:
//!
//! ```text
//! PENDING -> PROCESSING -> COMPLETED
//!    |           |  ^
//!    |           v  |
//!    |        RETRYING
//!    v           |
//!  FAILED <------+
//! ```
//!
//! A write tagged with a `job_id` other than the record's current one is stale and is rejected.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::kv::{KeyValueError, KeyValueStore};

const STATUS_PREFIX: &str = "ingestion:status:";
const MAX_CAS_ATTEMPTS: usize = 16;

/// Errors raised by [`JobMetadataStore`].
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] KeyValueError),
    /// Stored record could not be (de)serialized.
    #[error("status record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    /// Concurrent writers kept winning the compare-and-swap race.
    #[error("status record for '{document_id}' is under heavy contention")]
    Conflict {
        /// Contended document.
        document_id: String,
    },
}

/// Lifecycle state of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    /// Accepted and waiting in the queue.
    Pending,
    /// A worker holds the document lock and is running the pipeline.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; no further attempts.
    Failed,
    /// Failed transiently; another attempt is scheduled.
    Retrying,
}

impl IngestionStatus {
    /// Whether a record in `self` may move to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use IngestionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Retrying, Processing)
                | (Retrying, Failed)
        )
    }

    /// Whether no further transitions are possible for the current job.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Progress record for a document's latest ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIngestionProgress {
    /// Document the record describes.
    pub document_id: String,
    /// Job currently owning the record.
    pub job_id: String,
    /// Agent that submitted the document.
    #[serde(default)]
    pub agent_id: String,
    /// User that submitted the document.
    #[serde(default)]
    pub user_id: String,
    /// Lifecycle state.
    pub status: IngestionStatus,
    /// Percentage complete, 0 to 100.
    pub progress: u8,
    /// Name of the step being executed.
    pub current_step: String,
    /// Steps finished so far.
    pub completed_steps: u32,
    /// Steps in the pipeline.
    pub total_steps: u32,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt number, starting at 1 once processing begins.
    pub attempt: u32,
    /// Every status the record has passed through, in order.
    pub history: Vec<IngestionStatus>,
    /// When the job was accepted.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// When the record last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// When the job reached a terminal state.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl FileIngestionProgress {
    /// Whether the record belongs to `(agent_id, user_id)`.
    pub fn is_owned_by(&self, agent_id: &str, user_id: &str) -> bool {
        self.agent_id == agent_id && self.user_id == user_id
    }
}

/// A status change requested by a worker.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Job issuing the write.
    pub job_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Owning user.
    pub user_id: String,
    /// Target status.
    pub status: IngestionStatus,
    /// Step now in progress (or last executed).
    pub current_step: String,
    /// Steps finished so far.
    pub completed_steps: u32,
    /// Steps in the pipeline.
    pub total_steps: u32,
    /// Attempt number issuing the write.
    pub attempt: u32,
    /// Failure reason, for `FAILED` and `RETRYING`.
    pub error: Option<String>,
}

/// Result of a conditional status write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write was applied; the new record is returned.
    Applied(FileIngestionProgress),
    /// The write would regress the record or belongs to a superseded job.
    Stale {
        /// Status held by the record at rejection time.
        current: Option<IngestionStatus>,
    },
}

impl WriteOutcome {
    /// Whether the write was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// KV-backed store of [`FileIngestionProgress`] records.
#[derive(Clone)]
pub struct JobMetadataStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl JobMetadataStore {
    /// Records expire `ttl` after their last write.
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(document_id: &str) -> String {
        format!("{STATUS_PREFIX}{document_id}")
    }

    /// Start a fresh `PENDING` lifecycle for a newly enqueued job, replacing any record left by
    /// an older job. If the job already wrote its own record (a consumer picked it up first),
    /// that record is kept.
    pub async fn accept(
        &self,
        document_id: &str,
        job_id: &str,
        (agent_id, user_id): (&str, &str),
        total_steps: u32,
    ) -> Result<FileIngestionProgress, MetadataError> {
        let key = Self::key(document_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.kv.get(&key).await?;
            let current: Option<FileIngestionProgress> =
                raw.as_deref().map(serde_json::from_str).transpose()?;
            if let Some(record) = current.filter(|record| record.job_id == job_id) {
                return Ok(record);
            }

            let mut record = pending_record(document_id, job_id, total_steps);
            record.agent_id = agent_id.to_string();
            record.user_id = user_id.to_string();
            let swapped = self
                .kv
                .compare_and_swap(
                    &key,
                    raw.as_deref(),
                    serde_json::to_string(&record)?,
                    Some(self.ttl),
                )
                .await?;
            if swapped {
                tracing::debug!(document_id, job_id, "Status record accepted");
                return Ok(record);
            }
        }
        Err(MetadataError::Conflict {
            document_id: document_id.to_string(),
        })
    }

    /// Apply `update` if it moves the record forward for the owning job.
    pub async fn set_status(
        &self,
        document_id: &str,
        update: StatusUpdate,
    ) -> Result<WriteOutcome, MetadataError> {
        let key = Self::key(document_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.kv.get(&key).await?;
            let current: Option<FileIngestionProgress> =
                raw.as_deref().map(serde_json::from_str).transpose()?;

            let next = match &current {
                // A finished record belongs to an earlier job; a newer job starts over.
                Some(record) if record.job_id != update.job_id && record.status.is_terminal() => {
                    merge(None, document_id, &update)
                }
                Some(record) if record.job_id != update.job_id => {
                    tracing::debug!(document_id, job_id = %update.job_id, owner = %record.job_id, "Stale status write from superseded job");
                    return Ok(WriteOutcome::Stale {
                        current: Some(record.status),
                    });
                }
                Some(record) if !record.status.can_transition_to(update.status) => {
                    tracing::debug!(document_id, from = ?record.status, to = ?update.status, "Rejected status regression");
                    return Ok(WriteOutcome::Stale {
                        current: Some(record.status),
                    });
                }
                Some(record) => merge(Some(record), document_id, &update),
                None => merge(None, document_id, &update),
            };

            let swapped = self
                .kv
                .compare_and_swap(
                    &key,
                    raw.as_deref(),
                    serde_json::to_string(&next)?,
                    Some(self.ttl),
                )
                .await?;
            if swapped {
                return Ok(WriteOutcome::Applied(next));
            }
        }
        Err(MetadataError::Conflict {
            document_id: document_id.to_string(),
        })
    }

    /// Current record, if any.
    pub async fn get_status(
        &self,
        document_id: &str,
    ) -> Result<Option<FileIngestionProgress>, MetadataError> {
        let raw = self.kv.get(&Self::key(document_id)).await?;
        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    }

    /// Drop the record. Returns whether one existed.
    pub async fn clear(&self, document_id: &str) -> Result<bool, MetadataError> {
        Ok(self.kv.delete(&Self::key(document_id)).await?)
    }
}

fn pending_record(document_id: &str, job_id: &str, total_steps: u32) -> FileIngestionProgress {
    let now = OffsetDateTime::now_utc();
    FileIngestionProgress {
        document_id: document_id.to_string(),
        job_id: job_id.to_string(),
        agent_id: String::new(),
        user_id: String::new(),
        status: IngestionStatus::Pending,
        progress: 0,
        current_step: "queued".to_string(),
        completed_steps: 0,
        total_steps,
        error: None,
        attempt: 0,
        history: vec![IngestionStatus::Pending],
        started_at: now,
        updated_at: now,
        completed_at: None,
    }
}

fn merge(
    current: Option<&FileIngestionProgress>,
    document_id: &str,
    update: &StatusUpdate,
) -> FileIngestionProgress {
    let now = OffsetDateTime::now_utc();
    let mut history = current.map_or_else(
        || vec![IngestionStatus::Pending],
        |record| record.history.clone(),
    );
    if history.last() != Some(&update.status) {
        history.push(update.status);
    }
    let total_steps = update.total_steps.max(1);
    let completed_steps = update.completed_steps.min(total_steps);
    let progress = if update.status == IngestionStatus::Completed {
        100
    } else {
        (completed_steps * 100 / total_steps) as u8
    };

    FileIngestionProgress {
        document_id: document_id.to_string(),
        job_id: update.job_id.clone(),
        agent_id: update.agent_id.clone(),
        user_id: update.user_id.clone(),
        status: update.status,
        progress,
        current_step: update.current_step.clone(),
        completed_steps,
        total_steps,
        error: update.error.clone(),
        attempt: update.attempt,
        history,
        started_at: current.map_or(now, |record| record.started_at),
        updated_at: now,
        completed_at: update.status.is_terminal().then_some(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryKeyValueStore;

    fn store() -> JobMetadataStore {
        JobMetadataStore::new(Arc::new(InMemoryKeyValueStore::new()), Duration::from_secs(60))
    }

    fn update(job_id: &str, status: IngestionStatus, completed_steps: u32) -> StatusUpdate {
        StatusUpdate {
            job_id: job_id.into(),
            agent_id: "agent".into(),
            user_id: "user".into(),
            status,
            current_step: "step".into(),
            completed_steps,
            total_steps: 6,
            attempt: 1,
            error: None,
        }
    }

    #[test]
    fn transitions_only_move_forward() {
        use IngestionStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Retrying.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[tokio::test]
    async fn lifecycle_records_history_once_per_change() {
        let store = store();
        store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        for (status, steps) in [
            (IngestionStatus::Processing, 1),
            (IngestionStatus::Processing, 3),
            (IngestionStatus::Retrying, 3),
            (IngestionStatus::Processing, 4),
            (IngestionStatus::Completed, 6),
        ] {
            assert!(
                store
                    .set_status("doc", update("job-1", status, steps))
                    .await
                    .unwrap()
                    .is_applied()
            );
        }

        let record = store.get_status("doc").await.unwrap().unwrap();
        assert_eq!(record.progress, 100);
        assert_eq!(record.completed_steps, record.total_steps);
        assert!(record.completed_at.is_some());
        assert_eq!(
            record.history,
            vec![
                IngestionStatus::Pending,
                IngestionStatus::Processing,
                IngestionStatus::Retrying,
                IngestionStatus::Processing,
                IngestionStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn terminal_records_reject_regressions() {
        let store = store();
        store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        store
            .set_status("doc", update("job-1", IngestionStatus::Failed, 0))
            .await
            .unwrap();

        let outcome = store
            .set_status("doc", update("job-1", IngestionStatus::Processing, 1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Stale {
                current: Some(IngestionStatus::Failed)
            }
        );
    }

    #[tokio::test]
    async fn superseded_job_writes_are_stale() {
        let store = store();
        store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        store.accept("doc", "job-2", ("agent", "user"), 6).await.unwrap();

        let outcome = store
            .set_status("doc", update("job-1", IngestionStatus::Processing, 1))
            .await
            .unwrap();
        assert!(!outcome.is_applied());
        let record = store.get_status("doc").await.unwrap().unwrap();
        assert_eq!(record.job_id, "job-2");
        assert_eq!(record.status, IngestionStatus::Pending);
    }

    #[tokio::test]
    async fn accept_keeps_record_already_written_by_the_job() {
        let store = store();
        store
            .set_status("doc", update("job-1", IngestionStatus::Processing, 2))
            .await
            .unwrap();
        let record = store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        assert_eq!(record.status, IngestionStatus::Processing);
    }

    #[tokio::test]
    async fn new_job_takes_over_finished_record() {
        let store = store();
        store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        for (status, steps) in [
            (IngestionStatus::Processing, 2),
            (IngestionStatus::Completed, 6),
        ] {
            assert!(
                store
                    .set_status("doc", update("job-1", status, steps))
                    .await
                    .unwrap()
                    .is_applied()
            );
        }
        assert!(
            store
                .get_status("doc")
                .await
                .unwrap()
                .unwrap()
                .status
                .is_terminal()
        );

        let outcome = store
            .set_status("doc", update("job-2", IngestionStatus::Processing, 2))
            .await
            .unwrap();
        assert!(outcome.is_applied());
        let record = store.accept("doc", "job-2", ("agent", "user"), 6).await.unwrap();
        assert_eq!(record.job_id, "job-2");
        assert_eq!(
            record.history,
            vec![IngestionStatus::Pending, IngestionStatus::Processing]
        );
    }

    #[tokio::test]
    async fn records_remember_their_owner() {
        let store = store();
        let accepted = store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        assert!(accepted.is_owned_by("agent", "user"));
        assert!(!accepted.is_owned_by("agent", "someone-else"));

        let written = store
            .set_status("doc", update("job-1", IngestionStatus::Processing, 1))
            .await
            .unwrap();
        let WriteOutcome::Applied(record) = written else {
            panic!("processing write should apply");
        };
        assert!(record.is_owned_by("agent", "user"));
    }

    #[tokio::test]
    async fn clear_removes_record() {
        let store = store();
        store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        assert!(store.clear("doc").await.unwrap());
        assert!(store.get_status("doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_serializes_with_wire_names() {
        let store = store();
        let record = store.accept("doc", "job-1", ("agent", "user"), 6).await.unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "PENDING");
        assert_eq!(value["agentId"], "agent");
        assert_eq!(value["totalSteps"], 6);
        assert!(value["startedAt"].as_str().unwrap().contains('T'));
    }
}
