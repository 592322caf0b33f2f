//! Composition root wiring queues, coordination, storage, and the job processor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::coordination::{
    DistributedMutex, FileIngestionProgress, InMemoryKeyValueStore, JobMetadataStore,
    KeyValueStore, MetadataError,
};
use crate::embedding::{BatchingEmbeddingClient, EmbeddingClientError, build_embedding_client};
use crate::metrics::{IngestionMetrics, MetricsSnapshot};
use crate::processing::{
    ChunkOptions, FileIngestionJobData, IngestionWorker, JobProcessor, ProcessorError,
    ProcessorSettings, RetryPolicy, TOTAL_STEPS, ValidationPolicy, WorkerDeps, WorkerSettings,
};
use crate::qdrant::{QdrantError, QdrantVectorStore};
use crate::queue::{
    EnqueueOptions, EnqueuedJob, JobPayload, QueueError, QueueManager, QueueMetrics, QueueName,
};
use crate::vector_store::{
    InMemoryVectorStore, StoredFile, VectorStore, VectorStoreEntry, VectorStoreError,
    VectorStoreService,
};

/// Errors surfaced by [`WorkerManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Status record operation failed.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Vector store operation failed.
    #[error(transparent)]
    Store(#[from] VectorStoreError),
    /// Consumers did not stop cleanly.
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    /// Embedding client could not be built.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Qdrant collection could not be prepared.
    #[error(transparent)]
    Qdrant(#[from] QdrantError),
}

/// Tunables collected from configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Worker tunables.
    pub worker: WorkerSettings,
    /// Consumer pool tunables.
    pub processor: ProcessorSettings,
    /// Largest accepted upload, in bytes.
    pub max_file_size: u64,
    /// Lifetime of status records.
    pub status_ttl: Duration,
    /// Lifetime of cached listings.
    pub listing_ttl: Duration,
}

impl ManagerSettings {
    /// Derive settings from the process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker: WorkerSettings {
                chunk_defaults: ChunkOptions {
                    chunk_size: config.chunk_size,
                    overlap: config.chunk_overlap,
                    strategy: config.chunking_strategy,
                },
                lock_ttl: Duration::from_secs(config.lock_ttl_secs),
                retry: RetryPolicy::new(config.max_retries, config.retry_backoff_ms),
            },
            processor: ProcessorSettings {
                file_ingestion_concurrency: config.concurrency_file_ingestion,
                embeddings_concurrency: config.concurrency_embeddings,
                shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            },
            max_file_size: config.max_file_size_bytes,
            status_ttl: Duration::from_secs(config.status_ttl_secs),
            listing_ttl: Duration::from_secs(config.listing_cache_ttl_secs),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            processor: ProcessorSettings::default(),
            max_file_size: 10 * 1024 * 1024,
            status_ttl: Duration::from_secs(24 * 60 * 60),
            listing_ttl: Duration::from_secs(60),
        }
    }
}

/// Backends injected into the manager.
#[derive(Clone)]
pub struct Backends {
    /// Lock and status record store.
    pub kv: Arc<dyn KeyValueStore>,
    /// Vector persistence.
    pub vector_store: Arc<dyn VectorStore>,
    /// Embedding provider.
    pub embedder: BatchingEmbeddingClient,
}

/// Queue counts plus ingestion counters.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerMetrics {
    /// Per-queue counts keyed by queue name.
    pub queues: BTreeMap<&'static str, QueueMetrics>,
    /// Ingestion counters.
    pub ingestion: MetricsSnapshot,
}

/// Result of probing one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    /// Backend name.
    pub backend: &'static str,
    /// Whether the check succeeded.
    pub healthy: bool,
    /// Check error, when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendHealth {
    fn from_check<E: std::fmt::Display>(backend: &'static str, check: Result<(), E>) -> Self {
        match check {
            Ok(()) => Self {
                backend,
                healthy: true,
                error: None,
            },
            Err(error) => Self {
                backend,
                healthy: false,
                error: Some(error.to_string()),
            },
        }
    }
}

/// Operational snapshot of the worker process.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// Whether consumers are running.
    pub running: bool,
    /// Seconds since the last successful start, if running.
    pub uptime_secs: Option<u64>,
    /// Consumer pool configuration.
    pub concurrency: ProcessorSettings,
    /// Retry budget.
    pub retry_policy: RetryPolicy,
    /// Jobs executing right now, keyed by queue name.
    pub in_flight: BTreeMap<&'static str, usize>,
    /// Vector store health check.
    pub vector_store: BackendHealth,
    /// Key-value store health check.
    pub key_value_store: BackendHealth,
}

/// Surface used by the HTTP layer.
#[async_trait]
pub trait IngestionApi: Send + Sync {
    /// Queue a file for ingestion.
    async fn enqueue_file(&self, data: FileIngestionJobData) -> Result<EnqueuedJob, ManagerError>;

    /// Status record of a document's latest job, when it belongs to the owner.
    async fn get_status(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<FileIngestionProgress>, ManagerError>;

    /// Files stored for an owner.
    async fn list_files(&self, agent_id: &str, user_id: &str)
    -> Result<Vec<StoredFile>, ManagerError>;

    /// Stored chunks of one document.
    async fn get_file(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<VectorStoreEntry>, ManagerError>;

    /// Remove a document.
    async fn delete_file(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<usize, ManagerError>;

    /// Queue and ingestion counters.
    async fn get_metrics(&self) -> ManagerMetrics;

    /// Operational snapshot.
    async fn get_diagnostics(&self) -> Diagnostics;
}

#[derive(Default)]
struct Lifecycle {
    started_at: Option<Instant>,
}

/// Owns every component of the ingestion pipeline.
pub struct WorkerManager {
    queues: Arc<QueueManager>,
    processor: JobProcessor,
    metadata: JobMetadataStore,
    store: VectorStoreService,
    kv: Arc<dyn KeyValueStore>,
    metrics: Arc<IngestionMetrics>,
    retry: RetryPolicy,
    // Serializes start and stop; `lifecycle` is only held for reads and flips.
    transition: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkerManager {
    /// Wire components around the given backends, with queues that live only in this process.
    pub fn new(backends: Backends, settings: ManagerSettings) -> Self {
        Self::with_queues(backends, settings, Arc::new(QueueManager::new()))
    }

    /// Wire components around the given backends and queues.
    pub fn with_queues(
        backends: Backends,
        settings: ManagerSettings,
        queues: Arc<QueueManager>,
    ) -> Self {
        let Backends {
            kv,
            vector_store,
            embedder,
        } = backends;
        let metrics = Arc::new(IngestionMetrics::new());
        let metadata = JobMetadataStore::new(kv.clone(), settings.status_ttl);
        let store = VectorStoreService::new(vector_store, settings.listing_ttl);
        let retry = settings.worker.retry;

        let worker = Arc::new(IngestionWorker::new(
            WorkerDeps {
                validation: ValidationPolicy::new(settings.max_file_size),
                mutex: DistributedMutex::new(kv.clone()),
                metadata: metadata.clone(),
                embedder,
                store: store.clone(),
                queues: queues.clone(),
                metrics: metrics.clone(),
            },
            settings.worker,
        ));
        let processor = JobProcessor::new(
            worker,
            queues.clone(),
            store.clone(),
            metrics.clone(),
            settings.processor,
        );

        Self {
            queues,
            processor,
            metadata,
            store,
            kv,
            metrics,
            retry,
            transition: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Build backends from configuration: Qdrant when `QDRANT_URL` is set, in-memory otherwise.
    /// Queued jobs are journalled to `QUEUE_DATABASE_URL`.
    pub async fn from_config(config: &Config) -> Result<Self, ManagerError> {
        let vector_store: Arc<dyn VectorStore> = match config.qdrant_url.as_deref() {
            Some(url) => {
                let qdrant = QdrantVectorStore::new(
                    url,
                    config.qdrant_api_key.clone(),
                    &config.qdrant_collection_name,
                    config.embedding_dimension,
                )?;
                qdrant.initialize().await?;
                Arc::new(qdrant)
            }
            None => {
                tracing::warn!("QDRANT_URL not set; vectors are kept in memory");
                Arc::new(InMemoryVectorStore::with_dimension(
                    config.embedding_dimension,
                ))
            }
        };

        let queues = QueueManager::open(&config.queue_database_url)?;
        tracing::info!(url = %config.queue_database_url, "Queue journal configured");

        Ok(Self::with_queues(
            Backends {
                kv: Arc::new(InMemoryKeyValueStore::new()),
                vector_store,
                embedder: build_embedding_client(config)?,
            },
            ManagerSettings::from_config(config),
            Arc::new(queues),
        ))
    }

    /// Open the queues and start consumers. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let _transition = self.transition.lock().await;
        if self.is_running().await {
            tracing::debug!("Worker manager already running");
            return Ok(());
        }
        self.queues.initialize().await?;
        self.processor.force_restart_processing().await?;
        self.lifecycle.lock().await.started_at = Some(Instant::now());
        tracing::info!("Worker manager started");
        Ok(())
    }

    /// Drain consumers and close the queues. Queues are closed even when draining fails.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let _transition = self.transition.lock().await;
        if self.lifecycle.lock().await.started_at.take().is_none() {
            return Ok(());
        }

        let drained = self.processor.stop_processing().await;
        if let Err(error) = &drained {
            tracing::error!(error = %error, "Job consumers did not drain cleanly");
        }
        self.queues.close().await;
        tracing::info!("Worker manager stopped");
        drained.map_err(ManagerError::from)
    }

    /// Whether consumers are running.
    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.started_at.is_some()
    }

    /// Queue a job on an arbitrary queue.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueuedJob, ManagerError> {
        Ok(self.queues.enqueue(queue, payload, options).await?)
    }
}

#[async_trait]
impl IngestionApi for WorkerManager {
    async fn enqueue_file(&self, data: FileIngestionJobData) -> Result<EnqueuedJob, ManagerError> {
        let document_id = data.document_id.clone();
        let (agent_id, user_id) = (data.agent_id.clone(), data.user_id.clone());
        let enqueued = self
            .queues
            .enqueue(
                QueueName::FileIngestion,
                JobPayload::FileIngestion(data),
                EnqueueOptions::default(),
            )
            .await?;
        if !enqueued.deduplicated {
            self.metadata
                .accept(&document_id, &enqueued.id, (&agent_id, &user_id), TOTAL_STEPS)
                .await?;
        }
        tracing::info!(
            document_id = %document_id,
            job_id = %enqueued.id,
            deduplicated = enqueued.deduplicated,
            "File queued for ingestion"
        );
        Ok(enqueued)
    }

    async fn get_status(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<FileIngestionProgress>, ManagerError> {
        Ok(self
            .metadata
            .get_status(document_id)
            .await?
            .filter(|record| record.is_owned_by(agent_id, user_id)))
    }

    async fn list_files(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Vec<StoredFile>, ManagerError> {
        Ok(self.store.list_files(agent_id, user_id).await?)
    }

    async fn get_file(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<Vec<VectorStoreEntry>, ManagerError> {
        Ok(self.store.get_file(agent_id, document_id, user_id).await?)
    }

    async fn delete_file(
        &self,
        agent_id: &str,
        document_id: &str,
        user_id: &str,
    ) -> Result<usize, ManagerError> {
        let removed = self
            .store
            .delete_file(agent_id, document_id, user_id)
            .await?;
        self.metadata.clear(document_id).await?;
        Ok(removed)
    }

    async fn get_metrics(&self) -> ManagerMetrics {
        ManagerMetrics {
            queues: self.queues.get_all_queue_metrics().await,
            ingestion: self.metrics.snapshot(),
        }
    }

    async fn get_diagnostics(&self) -> Diagnostics {
        let uptime_secs = self
            .lifecycle
            .lock()
            .await
            .started_at
            .map(|started| started.elapsed().as_secs());
        Diagnostics {
            running: uptime_secs.is_some(),
            uptime_secs,
            concurrency: self.processor.settings(),
            retry_policy: self.retry,
            in_flight: self.processor.in_flight(),
            vector_store: BackendHealth::from_check(
                self.store.backend().backend_name(),
                self.store.health().await,
            ),
            key_value_store: BackendHealth::from_check("memory", self.kv.ping().await),
        }
    }
}
