//! Single-document pipeline: validate, lock, chunk, embed, store, finalize, unlock.

use std::sync::Arc;
use std::time::Duration;

use crate::coordination::{
    DistributedMutex, IngestionStatus, JobMetadataStore, LockError, LockGuard, StatusUpdate,
};
use crate::embedding::BatchingEmbeddingClient;
use crate::metrics::IngestionMetrics;
use crate::queue::{EnqueueOptions, JobPayload, QueueManager, QueueName};
use crate::vector_store::{DocumentInfo, VectorStoreError, VectorStoreService, build_entries};

use super::chunking::{ChunkOptions, chunk};
use super::retry::{Disposition, RetryPolicy};
use super::types::{
    Chunk, EmbeddingJobData, FailureKind, FileIngestionJobData, IngestionError, IngestionSummary,
};
use super::validation::ValidationPolicy;

/// Number of progress steps reported for every job.
pub const TOTAL_STEPS: u32 = 6;

/// Identity of the queue attempt being executed.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Queue job id.
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Tunables for [`IngestionWorker`].
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Chunking defaults merged with per-job overrides.
    pub chunk_defaults: ChunkOptions,
    /// Lifetime of the per-document lock.
    pub lock_ttl: Duration,
    /// Retry budget, used to decide between `RETRYING` and `FAILED`.
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            chunk_defaults: ChunkOptions::default(),
            lock_ttl: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators the worker drives.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Upload policy.
    pub validation: ValidationPolicy,
    /// Per-document locks.
    pub mutex: DistributedMutex,
    /// Status records.
    pub metadata: JobMetadataStore,
    /// Embedding provider.
    pub embedder: BatchingEmbeddingClient,
    /// Vector persistence.
    pub store: VectorStoreService,
    /// Queues, for deferred embedding.
    pub queues: Arc<QueueManager>,
    /// Ingestion counters.
    pub metrics: Arc<IngestionMetrics>,
}

/// Tracks which step a job reached so failures report accurate progress.
#[derive(Debug, Clone, Copy)]
struct Steps {
    completed: u32,
    current: &'static str,
}

impl Steps {
    fn new() -> Self {
        Self {
            completed: 0,
            current: "validate",
        }
    }

    fn advance(&mut self, completed: u32, current: &'static str) {
        self.completed = completed;
        self.current = current;
    }
}

/// Everything the pipeline needs to know about the document whose status it writes.
struct StatusTarget<'a> {
    document_id: &'a str,
    job_id: &'a str,
    agent_id: &'a str,
    user_id: &'a str,
    attempt: u32,
}

/// Executes ingestion jobs.
///
/// The document lock is released on every exit path, panics included, and the status record
/// is written before a job returns.
pub struct IngestionWorker {
    deps: WorkerDeps,
    settings: WorkerSettings,
}

impl IngestionWorker {
    /// Build a worker.
    pub fn new(deps: WorkerDeps, settings: WorkerSettings) -> Self {
        Self { deps, settings }
    }

    /// Retry budget shared with the job processor.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings.retry
    }

    /// Run a `fileIngestion` job.
    pub async fn process_file(
        &self,
        ctx: &JobContext,
        data: &FileIngestionJobData,
    ) -> Result<IngestionSummary, IngestionError> {
        let target = StatusTarget {
            document_id: &data.document_id,
            job_id: &ctx.job_id,
            agent_id: &data.agent_id,
            user_id: &data.user_id,
            attempt: ctx.attempt,
        };
        let mut steps = Steps::new();

        if let Err(error) = self.deps.validation.validate(data) {
            self.record_failure(&target, steps, &error).await;
            return Err(error);
        }
        steps.advance(1, "lock");

        let guard = self.lock(&data.document_id).await?;
        let result = self.run_file_locked(&target, data, &mut steps).await;
        self.release(guard).await;

        if let Err(error) = &result {
            self.record_failure(&target, steps, error).await;
        }
        result
    }

    /// Run an `embeddings` job produced by a deferred ingestion.
    pub async fn process_embeddings(
        &self,
        ctx: &JobContext,
        data: &EmbeddingJobData,
    ) -> Result<IngestionSummary, IngestionError> {
        let target = StatusTarget {
            document_id: &data.document_id,
            job_id: &data.ingestion_job_id,
            agent_id: &data.agent_id,
            user_id: &data.user_id,
            attempt: ctx.attempt,
        };
        let mut steps = Steps::new();
        steps.advance(3, "embed");

        let guard = self.lock(&data.document_id).await?;
        let result = self.run_embeddings_locked(&target, data, &mut steps).await;
        self.release(guard).await;

        if let Err(error) = &result {
            self.record_failure(&target, steps, error).await;
        }
        result
    }

    /// Record the failure of an attempt that never returned, such as one that panicked.
    ///
    /// Progress is carried over from the job's current record so the step count does not reset.
    pub async fn record_abort(&self, ctx: &JobContext, payload: &JobPayload, error: &IngestionError) {
        let (document_id, job_id) = match payload {
            JobPayload::FileIngestion(data) => (data.document_id.as_str(), ctx.job_id.as_str()),
            JobPayload::Embeddings(data) => {
                (data.document_id.as_str(), data.ingestion_job_id.as_str())
            }
        };
        let (agent_id, user_id) = payload.owner();
        let target = StatusTarget {
            document_id,
            job_id,
            agent_id,
            user_id,
            attempt: ctx.attempt,
        };
        let mut steps = Steps::new();
        steps.current = "aborted";
        match self.deps.metadata.get_status(document_id).await {
            Ok(Some(record)) if record.job_id == job_id => {
                steps.completed = record.completed_steps;
            }
            Ok(_) => {}
            Err(lookup) => tracing::debug!(document_id, error = %lookup, "No progress to carry over"),
        }
        self.record_failure(&target, steps, error).await;
    }

    async fn run_file_locked(
        &self,
        target: &StatusTarget<'_>,
        data: &FileIngestionJobData,
        steps: &mut Steps,
    ) -> Result<IngestionSummary, IngestionError> {
        steps.advance(2, "chunk");
        self.write_progress(target, *steps).await;

        let options = data.options.resolve(&self.settings.chunk_defaults);
        let text = data.text();
        let chunks = chunk(&data.document_id, &text, &options)?;
        if chunks.is_empty() {
            return Err(IngestionError::Validation(
                "file produced no chunks; it contains no text".to_string(),
            ));
        }
        tracing::debug!(
            document_id = %data.document_id,
            strategy = %options.strategy,
            chunks = chunks.len(),
            "Document chunked"
        );
        steps.advance(3, "embed");
        self.write_progress(target, *steps).await;

        if data.options.store_vectors && !data.options.generate_embeddings {
            return self.defer_embeddings(target, data, chunks, steps).await;
        }

        let vectors = if data.options.generate_embeddings {
            self.embed(&chunks).await?
        } else {
            Vec::new()
        };
        steps.advance(4, "store");
        self.write_progress(target, *steps).await;

        let info = DocumentInfo {
            document_id: data.document_id.clone(),
            original_name: data.original_name.clone(),
            mime_type: data.mime_type.clone(),
            file_size: data.size,
        };
        let stored = if data.options.store_vectors {
            self.persist(&data.agent_id, &data.user_id, &info, &chunks, vectors)
                .await?
        } else {
            tracing::info!(document_id = %data.document_id, "Dry run; vectors not stored");
            0
        };

        self.finalize(target, steps, chunks.len(), stored).await
    }

    async fn run_embeddings_locked(
        &self,
        target: &StatusTarget<'_>,
        data: &EmbeddingJobData,
        steps: &mut Steps,
    ) -> Result<IngestionSummary, IngestionError> {
        self.write_progress(target, *steps).await;
        let vectors = self.embed(&data.chunks).await?;
        steps.advance(4, "store");
        self.write_progress(target, *steps).await;

        let info = DocumentInfo {
            document_id: data.document_id.clone(),
            original_name: data.original_name.clone(),
            mime_type: data.mime_type.clone(),
            file_size: data.size,
        };
        let stored = self
            .persist(&data.agent_id, &data.user_id, &info, &data.chunks, vectors)
            .await?;
        self.finalize(target, steps, data.chunks.len(), stored).await
    }

    async fn defer_embeddings(
        &self,
        target: &StatusTarget<'_>,
        data: &FileIngestionJobData,
        chunks: Vec<Chunk>,
        steps: &mut Steps,
    ) -> Result<IngestionSummary, IngestionError> {
        let chunk_count = chunks.len();
        let payload = JobPayload::Embeddings(EmbeddingJobData {
            ingestion_job_id: target.job_id.to_string(),
            document_id: data.document_id.clone(),
            agent_id: data.agent_id.clone(),
            user_id: data.user_id.clone(),
            original_name: data.original_name.clone(),
            mime_type: data.mime_type.clone(),
            size: data.size,
            chunks,
        });
        let enqueued = self
            .deps
            .queues
            .enqueue(
                QueueName::Embeddings,
                payload,
                EnqueueOptions {
                    job_id: Some(format!("{}-embeddings", target.job_id)),
                    ..EnqueueOptions::default()
                },
            )
            .await
            .map_err(|error| IngestionError::Transient {
                stage: "enqueue",
                message: error.to_string(),
            })?;

        steps.advance(3, "awaiting embeddings");
        self.write_progress(target, *steps).await;
        tracing::info!(
            document_id = %data.document_id,
            embeddings_job_id = %enqueued.id,
            chunks = chunk_count,
            "Embedding deferred to queue"
        );
        Ok(IngestionSummary {
            document_id: data.document_id.clone(),
            chunk_count,
            stored: 0,
            deferred: true,
        })
    }

    async fn embed(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, IngestionError> {
        self.deps
            .embedder
            .embed(chunks)
            .await
            .map_err(IngestionError::from_embedding)
    }

    /// Write vectors. A failed write removes the document's rows so no partial set survives.
    async fn persist(
        &self,
        agent_id: &str,
        user_id: &str,
        info: &DocumentInfo,
        chunks: &[Chunk],
        vectors: Vec<Vec<f32>>,
    ) -> Result<usize, IngestionError> {
        if vectors.len() != chunks.len() {
            return Err(IngestionError::Corruption {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        let entries = build_entries(info, chunks, vectors);
        match self.deps.store.store(agent_id, user_id, entries).await {
            Ok(summary) => {
                tracing::debug!(
                    document_id = %info.document_id,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    removed_stale = summary.removed_stale,
                    "Vectors stored"
                );
                Ok(summary.written())
            }
            Err(error) => {
                match self
                    .deps
                    .store
                    .delete_file(agent_id, &info.document_id, user_id)
                    .await
                {
                    Ok(_) | Err(VectorStoreError::NotFound { .. }) => {}
                    Err(cleanup) => tracing::warn!(
                        document_id = %info.document_id,
                        error = %cleanup,
                        "Failed to remove partial rows after store error"
                    ),
                }
                Err(IngestionError::from_store(error))
            }
        }
    }

    async fn finalize(
        &self,
        target: &StatusTarget<'_>,
        steps: &mut Steps,
        chunk_count: usize,
        stored: usize,
    ) -> Result<IngestionSummary, IngestionError> {
        steps.advance(TOTAL_STEPS, "done");
        self.deps.metrics.record_document(chunk_count as u64);
        self.write_status(target, IngestionStatus::Completed, *steps, None)
            .await;
        tracing::info!(
            document_id = target.document_id,
            job_id = target.job_id,
            chunks = chunk_count,
            stored,
            "Document ingested"
        );
        Ok(IngestionSummary {
            document_id: target.document_id.to_string(),
            chunk_count,
            stored,
            deferred: false,
        })
    }

    async fn lock(&self, document_id: &str) -> Result<LockGuard, IngestionError> {
        match self
            .deps
            .mutex
            .lock(document_id, self.settings.lock_ttl)
            .await
        {
            Ok(guard) => Ok(guard),
            Err(LockError::Busy { .. }) => {
                tracing::debug!(document_id, "Document locked by another worker");
                Err(IngestionError::Contention {
                    document_id: document_id.to_string(),
                })
            }
            Err(error) => Err(IngestionError::Transient {
                stage: "lock",
                message: error.to_string(),
            }),
        }
    }

    async fn release(&self, guard: LockGuard) {
        let key = guard.key().to_string();
        if let Err(error) = guard.release().await {
            tracing::warn!(key = %key, error = %error, "Lock release failed");
        }
    }

    async fn record_failure(&self, target: &StatusTarget<'_>, steps: Steps, error: &IngestionError) {
        let status = match self.settings.retry.disposition(error.kind(), target.attempt) {
            Disposition::Requeue(_) => return,
            Disposition::Retry(_) => IngestionStatus::Retrying,
            Disposition::Fail => IngestionStatus::Failed,
        };
        match error.kind() {
            FailureKind::Corruption => tracing::error!(
                document_id = target.document_id,
                job_id = target.job_id,
                error = %error,
                "Chunk/vector pairing broken"
            ),
            _ => tracing::warn!(
                document_id = target.document_id,
                job_id = target.job_id,
                attempt = target.attempt,
                status = ?status,
                error = %error,
                "Ingestion attempt failed"
            ),
        }
        self.write_status(target, status, steps, Some(error.to_string()))
            .await;
    }

    async fn write_progress(&self, target: &StatusTarget<'_>, steps: Steps) {
        self.write_status(target, IngestionStatus::Processing, steps, None)
            .await;
    }

    async fn write_status(
        &self,
        target: &StatusTarget<'_>,
        status: IngestionStatus,
        steps: Steps,
        error: Option<String>,
    ) {
        let update = StatusUpdate {
            job_id: target.job_id.to_string(),
            agent_id: target.agent_id.to_string(),
            user_id: target.user_id.to_string(),
            status,
            current_step: steps.current.to_string(),
            completed_steps: steps.completed,
            total_steps: TOTAL_STEPS,
            attempt: target.attempt,
            error,
        };
        match self.deps.metadata.set_status(target.document_id, update).await {
            Ok(outcome) if !outcome.is_applied() => tracing::debug!(
                document_id = target.document_id,
                status = ?status,
                "Status write ignored as stale"
            ),
            Ok(_) => {}
            Err(error) => tracing::warn!(
                document_id = target.document_id,
                error = %error,
                "Failed to record job status"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryKeyValueStore;
    use crate::embedding::HashEmbeddingClient;
    use crate::processing::IngestionOptions;
    use crate::vector_store::InMemoryVectorStore;

    struct Fixture {
        worker: IngestionWorker,
        deps: WorkerDeps,
    }

    async fn fixture(store_dimension: usize) -> Fixture {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let queues = Arc::new(QueueManager::new());
        queues.initialize().await.unwrap();
        let deps = WorkerDeps {
            validation: ValidationPolicy::default(),
            mutex: DistributedMutex::new(kv.clone()),
            metadata: JobMetadataStore::new(kv, Duration::from_secs(60)),
            embedder: BatchingEmbeddingClient::new(Arc::new(HashEmbeddingClient::new(8)), 16, 8),
            store: VectorStoreService::new(
                Arc::new(InMemoryVectorStore::with_dimension(store_dimension)),
                Duration::from_secs(60),
            ),
            queues,
            metrics: Arc::new(IngestionMetrics::new()),
        };
        Fixture {
            worker: IngestionWorker::new(deps.clone(), WorkerSettings::default()),
            deps,
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            job_id: "job-1".into(),
            attempt: 1,
        }
    }

    fn file(content: &str) -> FileIngestionJobData {
        FileIngestionJobData::new("doc", "agent", "user", "a.txt", "text/plain", content)
    }

    #[tokio::test]
    async fn dry_run_completes_without_rows() {
        let Fixture { worker, deps } = fixture(8).await;
        let data = file("alpha beta gamma").with_options(IngestionOptions {
            store_vectors: false,
            ..Default::default()
        });

        let summary = worker.process_file(&ctx(), &data).await.unwrap();
        assert_eq!(summary.chunk_count, 1);
        assert_eq!(summary.stored, 0);
        assert!(deps.store.list_files("agent", "user").await.unwrap().is_empty());
        let record = deps.metadata.get_status("doc").await.unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Completed);
    }

    #[tokio::test]
    async fn blank_file_fails_and_releases_lock() {
        let Fixture { worker, deps } = fixture(8).await;

        let error = worker.process_file(&ctx(), &file("  \n\t ")).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Validation);
        assert!(!deps.mutex.is_locked("doc").await.unwrap());
        let record = deps.metadata.get_status("doc").await.unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Failed);
    }

    #[tokio::test]
    async fn held_lock_reports_contention_without_status() {
        let Fixture { worker, deps } = fixture(8).await;
        let _token = deps
            .mutex
            .acquire("doc", Duration::from_secs(30))
            .await
            .unwrap();

        let error = worker.process_file(&ctx(), &file("alpha beta")).await.unwrap_err();
        assert_eq!(error.kind(), FailureKind::Contention);
        assert!(deps.metadata.get_status("doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_store_write_is_retryable_and_leaves_no_rows() {
        let Fixture { worker, deps } = fixture(4).await;

        let error = worker.process_file(&ctx(), &file("alpha beta")).await.unwrap_err();
        assert!(error.is_retryable());
        assert!(deps.store.list_files("agent", "user").await.unwrap().is_empty());
        let record = deps.metadata.get_status("doc").await.unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Retrying);
        assert_eq!(record.current_step, "store");
        assert!(!deps.mutex.is_locked("doc").await.unwrap());
    }
}
