use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rusty_ingest::coordination::{
    DistributedMutex, FileIngestionProgress, InMemoryKeyValueStore, IngestionStatus,
    KeyValueError, KeyValueStore,
};
use rusty_ingest::embedding::{
    BatchingEmbeddingClient, EmbeddingClient, EmbeddingClientError, HashEmbeddingClient,
};
use rusty_ingest::manager::{Backends, IngestionApi, ManagerError, ManagerSettings, WorkerManager};
use rusty_ingest::processing::{
    FileIngestionJobData, IngestionOptions, ProcessorSettings, RetryPolicy, WorkerSettings,
};
use rusty_ingest::queue::{QueueError, QueueManager};
use rusty_ingest::vector_store::{InMemoryVectorStore, VectorStoreError};

const DIMENSION: usize = 8;

/// Counts lock acquisitions while delegating to the in-memory store.
#[derive(Default)]
struct CountingKv {
    inner: InMemoryKeyValueStore,
    lock_attempts: AtomicUsize,
}

#[async_trait]
impl KeyValueStore for CountingKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KeyValueError> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KeyValueError> {
        if key.starts_with("lock:") {
            self.lock_attempts.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool, KeyValueError> {
        self.inner.compare_and_swap(key, expected, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, KeyValueError> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn delete(&self, key: &str) -> Result<bool, KeyValueError> {
        self.inner.delete(key).await
    }
}

/// Fails the first `failures` calls, then hashes.
struct FlakyEmbedder {
    failures: AtomicUsize,
    inner: HashEmbeddingClient,
}

impl FlakyEmbedder {
    fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            inner: HashEmbeddingClient::new(DIMENSION),
        }
    }
}

#[async_trait]
impl EmbeddingClient for FlakyEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EmbeddingClientError::GenerationFailed(
                "provider temporarily unavailable".into(),
            ));
        }
        self.inner.generate_embeddings(texts).await
    }
}

/// Panics on the first call, then hashes.
struct PanickingEmbedder {
    panicked: AtomicUsize,
    inner: HashEmbeddingClient,
}

#[async_trait]
impl EmbeddingClient for PanickingEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.panicked.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("embedding provider crashed");
        }
        self.inner.generate_embeddings(texts).await
    }
}

/// Hashes after a fixed delay.
struct SlowEmbedder {
    delay: Duration,
    inner: HashEmbeddingClient,
}

#[async_trait]
impl EmbeddingClient for SlowEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        tokio::time::sleep(self.delay).await;
        self.inner.generate_embeddings(texts).await
    }
}

struct Harness {
    manager: WorkerManager,
    kv: Arc<CountingKv>,
}

fn settings(max_retries: u32) -> ManagerSettings {
    ManagerSettings {
        worker: WorkerSettings {
            retry: RetryPolicy::new(max_retries, 20),
            ..WorkerSettings::default()
        },
        processor: ProcessorSettings {
            file_ingestion_concurrency: 2,
            embeddings_concurrency: 1,
            shutdown_timeout: Duration::from_secs(5),
        },
        ..ManagerSettings::default()
    }
}

async fn harness_with(embedder: Arc<dyn EmbeddingClient>, max_retries: u32) -> Harness {
    let kv = Arc::new(CountingKv::default());
    let manager = WorkerManager::new(
        Backends {
            kv: kv.clone(),
            vector_store: Arc::new(InMemoryVectorStore::with_dimension(DIMENSION)),
            embedder: BatchingEmbeddingClient::new(embedder, 4, DIMENSION),
        },
        settings(max_retries),
    );
    manager.start().await.expect("manager starts");
    Harness { manager, kv }
}

async fn harness() -> Harness {
    harness_with(Arc::new(HashEmbeddingClient::new(DIMENSION)), 3).await
}

fn document(document_id: &str, words: usize) -> FileIngestionJobData {
    let text = (0..words)
        .map(|index| format!("word{index}"))
        .collect::<Vec<_>>()
        .join(" ");
    FileIngestionJobData::new(document_id, "agent", "user", "notes.txt", "text/plain", text)
        .with_options(IngestionOptions {
            chunk_size: Some(20),
            overlap: Some(5),
            ..IngestionOptions::default()
        })
}

async fn wait_for_terminal(
    manager: &WorkerManager,
    document_id: &str,
    job_id: &str,
) -> FileIngestionProgress {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = manager.get_status("agent", document_id, "user").await.expect("status")
            && record.job_id == job_id
            && record.status.is_terminal()
        {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} for {document_id} did not finish"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `count` jobs on `queue` have left the active set for good.
async fn wait_for_settled(manager: &WorkerManager, queue: &str, count: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let metrics = manager.get_metrics().await;
        let settled = metrics
            .queues
            .get(queue)
            .map_or(0, |counts| counts.completed + counts.failed);
        if settled >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{queue} never settled {count} job(s)"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn document_round_trip_reaches_completed() {
    let Harness { manager, .. } = harness().await;

    let job = manager.enqueue_file(document("doc-1", 60)).await.unwrap();
    assert!(!job.deduplicated);
    let record = wait_for_terminal(&manager, "doc-1", &job.id).await;

    assert_eq!(record.status, IngestionStatus::Completed);
    assert_eq!(record.progress, 100);
    assert_eq!(record.completed_steps, record.total_steps);
    assert_eq!(record.history.first(), Some(&IngestionStatus::Pending));
    assert_eq!(record.history.last(), Some(&IngestionStatus::Completed));

    let files = manager.list_files("agent", "user").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].document_id, "doc-1");
    assert!(files[0].chunk_count > 1);

    let chunks = manager.get_file("agent", "doc-1", "user").await.unwrap();
    assert_eq!(chunks.len(), files[0].chunk_count);
    for (index, entry) in chunks.iter().enumerate() {
        assert_eq!(entry.metadata.chunk_index, index);
        assert_eq!(entry.vector.len(), DIMENSION);
    }

    wait_for_settled(&manager, "fileIngestion", 1).await;
    let metrics = manager.get_metrics().await;
    assert_eq!(metrics.ingestion.documents_ingested, 1);
    assert_eq!(metrics.queues["fileIngestion"].completed, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn disallowed_mime_type_fails_without_taking_the_lock() {
    let Harness { manager, kv } = harness().await;

    let mut data = document("doc-bad", 10);
    data.mime_type = "application/x-msdownload".into();
    let job = manager.enqueue_file(data).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-bad", &job.id).await;

    assert_eq!(record.status, IngestionStatus::Failed);
    assert!(record.error.is_some());
    assert!(!record.history.contains(&IngestionStatus::Processing));
    assert_eq!(kv.lock_attempts.load(Ordering::SeqCst), 0);
    assert!(manager.list_files("agent", "user").await.unwrap().is_empty());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn transient_embedding_failure_is_retried_once() {
    let Harness { manager, .. } = harness_with(Arc::new(FlakyEmbedder::new(1)), 3).await;

    let job = manager.enqueue_file(document("doc-flaky", 30)).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-flaky", &job.id).await;

    assert_eq!(record.status, IngestionStatus::Completed);
    assert_eq!(record.completed_steps, record.total_steps);
    assert_eq!(record.attempt, 2);
    assert_eq!(
        record
            .history
            .iter()
            .filter(|status| **status == IngestionStatus::Retrying)
            .count(),
        1
    );
    assert_eq!(manager.get_metrics().await.ingestion.jobs_retried, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_end_in_failed() {
    let Harness { manager, .. } = harness_with(Arc::new(FlakyEmbedder::new(10)), 1).await;

    let job = manager.enqueue_file(document("doc-down", 30)).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-down", &job.id).await;

    assert_eq!(record.status, IngestionStatus::Failed);
    assert_eq!(record.attempt, 2);
    wait_for_settled(&manager, "fileIngestion", 1).await;
    let metrics = manager.get_metrics().await;
    assert_eq!(metrics.ingestion.jobs_failed, 1);
    assert_eq!(metrics.queues["fileIngestion"].failed, 1);
    assert!(manager.list_files("agent", "user").await.unwrap().is_empty());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn locked_document_is_requeued_until_free() {
    let Harness { manager, kv } = harness().await;
    let mutex = DistributedMutex::new(kv.clone());
    let token = mutex
        .acquire("doc-busy", Duration::from_secs(30))
        .await
        .unwrap();

    let job = manager.enqueue_file(document("doc-busy", 30)).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.get_metrics().await.ingestion.contention_requeues == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never hit the lock");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = manager.get_status("agent", "doc-busy", "user").await.unwrap().unwrap();
    assert_eq!(status.status, IngestionStatus::Pending);

    mutex.release(&token).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-busy", &job.id).await;
    assert_eq!(record.status, IngestionStatus::Completed);
    assert_eq!(record.attempt, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn reingesting_a_document_replaces_its_chunks() {
    let Harness { manager, .. } = harness().await;

    let first = manager.enqueue_file(document("doc-1", 60)).await.unwrap();
    wait_for_terminal(&manager, "doc-1", &first.id).await;
    wait_for_settled(&manager, "fileIngestion", 1).await;
    let before = manager.get_file("agent", "doc-1", "user").await.unwrap();

    let second = manager.enqueue_file(document("doc-1", 25)).await.unwrap();
    assert_ne!(first.id, second.id);
    let record = wait_for_terminal(&manager, "doc-1", &second.id).await;
    assert_eq!(record.status, IngestionStatus::Completed);

    let after = manager.get_file("agent", "doc-1", "user").await.unwrap();
    assert!(after.len() < before.len());
    let files = manager.list_files("agent", "user").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].chunk_count, after.len());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn deferred_embeddings_complete_on_the_embeddings_queue() {
    let Harness { manager, .. } = harness().await;

    let data = document("doc-deferred", 40).with_options(IngestionOptions {
        chunk_size: Some(20),
        overlap: Some(5),
        generate_embeddings: false,
        ..IngestionOptions::default()
    });
    let job = manager.enqueue_file(data).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-deferred", &job.id).await;

    assert_eq!(record.status, IngestionStatus::Completed);
    let chunks = manager
        .get_file("agent", "doc-deferred", "user")
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    wait_for_settled(&manager, "embeddings", 1).await;
    let metrics = manager.get_metrics().await;
    assert_eq!(metrics.queues["embeddings"].completed, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn deleting_a_document_removes_rows_and_status() {
    let Harness { manager, .. } = harness().await;

    let job = manager.enqueue_file(document("doc-1", 30)).await.unwrap();
    wait_for_terminal(&manager, "doc-1", &job.id).await;

    let removed = manager.delete_file("agent", "doc-1", "user").await.unwrap();
    assert!(removed > 0);
    assert!(manager.get_status("agent", "doc-1", "user").await.unwrap().is_none());
    assert!(manager.list_files("agent", "user").await.unwrap().is_empty());

    let missing = manager.get_file("agent", "doc-1", "user").await;
    assert!(matches!(
        missing,
        Err(ManagerError::Store(VectorStoreError::NotFound { .. }))
    ));
    let again = manager.delete_file("agent", "doc-1", "user").await;
    assert!(matches!(
        again,
        Err(ManagerError::Store(VectorStoreError::NotFound { .. }))
    ));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_manager_rejects_new_work() {
    let Harness { manager, .. } = harness().await;
    manager.start().await.unwrap();
    assert!(manager.get_diagnostics().await.running);

    manager.stop().await.unwrap();
    manager.stop().await.unwrap();
    assert!(!manager.is_running().await);

    let rejected = manager.enqueue_file(document("doc-late", 5)).await;
    assert!(matches!(
        rejected,
        Err(ManagerError::Queue(QueueError::Closed))
    ));
}

#[tokio::test]
async fn panicking_job_releases_its_lock_and_is_retried() {
    let embedder = Arc::new(PanickingEmbedder {
        panicked: AtomicUsize::new(0),
        inner: HashEmbeddingClient::new(DIMENSION),
    });
    let Harness { manager, kv } = harness_with(embedder, 3).await;

    let job = manager.enqueue_file(document("doc-crash", 30)).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-crash", &job.id).await;

    assert_eq!(record.status, IngestionStatus::Completed);
    assert_eq!(record.attempt, 2);
    assert!(record.history.contains(&IngestionStatus::Retrying));
    assert!(
        !DistributedMutex::new(kv.clone())
            .is_locked("doc-crash")
            .await
            .unwrap()
    );
    assert_eq!(manager.get_metrics().await.ingestion.jobs_retried, 1);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn status_is_hidden_from_other_owners() {
    let Harness { manager, .. } = harness().await;

    let job = manager.enqueue_file(document("doc-private", 10)).await.unwrap();
    let record = wait_for_terminal(&manager, "doc-private", &job.id).await;
    assert!(record.is_owned_by("agent", "user"));

    assert!(
        manager
            .get_status("agent", "doc-private", "someone-else")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        manager
            .get_status("other-agent", "doc-private", "user")
            .await
            .unwrap()
            .is_none()
    );

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn diagnostics_answer_while_stop_drains() {
    let embedder = Arc::new(SlowEmbedder {
        delay: Duration::from_millis(500),
        inner: HashEmbeddingClient::new(DIMENSION),
    });
    let Harness { manager, .. } = harness_with(embedder, 3).await;
    let manager = Arc::new(manager);

    manager.enqueue_file(document("doc-slow", 10)).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.get_diagnostics().await.in_flight["fileIngestion"] == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stopping = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let diagnostics = tokio::time::timeout(Duration::from_millis(200), manager.get_diagnostics())
        .await
        .expect("diagnostics blocked behind shutdown");
    assert!(!diagnostics.running);

    stopping.await.unwrap().unwrap();
}

#[tokio::test]
async fn queued_work_survives_a_restart() {
    let path = std::env::temp_dir().join(format!("rusty-ingest-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    let kv = Arc::new(CountingKv::default());
    let vector_store = Arc::new(InMemoryVectorStore::with_dimension(DIMENSION));
    let backends = Backends {
        kv: kv.clone(),
        vector_store,
        embedder: BatchingEmbeddingClient::new(
            Arc::new(HashEmbeddingClient::new(DIMENSION)),
            4,
            DIMENSION,
        ),
    };

    // Accept a job without ever running consumers, then drop everything.
    let job = {
        let queues = Arc::new(QueueManager::open(&url).unwrap());
        queues.initialize().await.unwrap();
        let manager = WorkerManager::with_queues(backends.clone(), settings(3), queues);
        manager.enqueue_file(document("doc-restart", 30)).await.unwrap()
    };

    let queues = Arc::new(QueueManager::open(&url).unwrap());
    let manager = WorkerManager::with_queues(backends, settings(3), queues);
    manager.start().await.unwrap();
    let record = wait_for_terminal(&manager, "doc-restart", &job.id).await;
    assert_eq!(record.status, IngestionStatus::Completed);
    assert_eq!(
        manager.list_files("agent", "user").await.unwrap()[0].document_id,
        "doc-restart"
    );

    manager.stop().await.unwrap();
    let _ = std::fs::remove_file(&path);
}
