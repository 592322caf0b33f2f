//! Named job queues feeding the ingestion workers.
//!
//! Unfinished jobs are journalled to SQLite, so a restarted process picks up where the last
//! one stopped.

mod journal;
mod manager;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::processing::{EmbeddingJobData, FileIngestionJobData};

pub use manager::QueueManager;

/// Queues served by the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum QueueName {
    /// Raw uploads awaiting chunking.
    #[serde(rename = "fileIngestion")]
    FileIngestion,
    /// Chunked documents awaiting deferred embedding.
    #[serde(rename = "embeddings")]
    Embeddings,
}

impl QueueName {
    /// Every queue, in processing order.
    pub const ALL: [QueueName; 2] = [QueueName::FileIngestion, QueueName::Embeddings];

    /// Wire name of the queue.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileIngestion => "fileIngestion",
            Self::Embeddings => "embeddings",
        }
    }

    /// Queue with the given wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|queue| queue.as_str() == name)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried by a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "data", rename_all = "camelCase")]
pub enum JobPayload {
    /// Upload to chunk, embed, and store.
    FileIngestion(FileIngestionJobData),
    /// Chunks to embed and store.
    Embeddings(EmbeddingJobData),
}

impl JobPayload {
    /// Queue this payload belongs on.
    pub fn queue(&self) -> QueueName {
        match self {
            Self::FileIngestion(_) => QueueName::FileIngestion,
            Self::Embeddings(_) => QueueName::Embeddings,
        }
    }

    /// Document the job operates on.
    pub fn document_id(&self) -> &str {
        match self {
            Self::FileIngestion(data) => &data.document_id,
            Self::Embeddings(data) => &data.document_id,
        }
    }

    /// Owning `(agent_id, user_id)`.
    pub fn owner(&self) -> (&str, &str) {
        match self {
            Self::FileIngestion(data) => (&data.agent_id, &data.user_id),
            Self::Embeddings(data) => (&data.agent_id, &data.user_id),
        }
    }
}

/// Where a job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be dequeued.
    Waiting,
    /// Scheduled for later.
    Delayed,
    /// Held by a consumer.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobState {
    /// Lowercase name, as stored in the journal.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        [
            Self::Waiting,
            Self::Delayed,
            Self::Active,
            Self::Completed,
            Self::Failed,
        ]
        .into_iter()
        .find(|state| state.as_str() == name)
    }
}

/// Snapshot of a job as tracked by the queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// Job identifier.
    pub id: String,
    /// Owning queue.
    pub queue: QueueName,
    /// Immutable payload.
    pub payload: Arc<JobPayload>,
    /// Attempts started so far, including the current one while active.
    pub attempts_made: u32,
    /// Current state.
    pub state: JobState,
    /// When the job was enqueued.
    pub enqueued_at: OffsetDateTime,
    /// Error recorded by the last failed attempt.
    pub last_error: Option<String>,
}

/// Options for [`QueueManager::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Hold the job back for this long before it becomes ready.
    pub delay: Option<Duration>,
    /// Return the existing job when the document already has one pending.
    pub deduplicate: bool,
    /// Caller-chosen job id; a random one is generated otherwise.
    pub job_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: None,
            deduplicate: true,
            job_id: None,
        }
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueuedJob {
    /// Identifier of the (possibly pre-existing) job.
    pub id: String,
    /// `true` when an existing job was returned instead of a new one.
    pub deduplicated: bool,
}

/// Per-queue counts, computed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    /// Jobs ready to run.
    pub waiting: usize,
    /// Jobs held by consumers.
    pub active: usize,
    /// Jobs finished successfully since startup.
    pub completed: u64,
    /// Jobs finished unsuccessfully since startup.
    pub failed: u64,
    /// Jobs scheduled for later.
    pub delayed: usize,
}

/// Errors raised by [`QueueManager`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queues are not accepting work.
    #[error("queues are closed")]
    Closed,
    /// The job journal could not be read or written.
    #[error("queue journal failed: {0}")]
    Journal(#[from] sqlx::Error),
    /// A payload could not be encoded for the journal.
    #[error("queued payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    /// Payload type does not belong on the target queue.
    #[error("payload for '{payload}' cannot be enqueued on '{queue}'")]
    PayloadMismatch {
        /// Target queue.
        queue: QueueName,
        /// Queue the payload belongs on.
        payload: QueueName,
    },
    /// No job with this id is tracked.
    #[error("unknown job '{0}'")]
    UnknownJob(String),
    /// Operation is not valid in the job's current state.
    #[error("job '{job_id}' is {state:?}")]
    InvalidState {
        /// Job identifier.
        job_id: String,
        /// State the job was found in.
        state: JobState,
    },
}
