use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion activity.
#[derive(Default)]
pub struct IngestionMetrics {
    documents_ingested: AtomicU64,
    chunks_stored: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    contention_requeues: AtomicU64,
    last_chunk_count: AtomicU64,
}

impl IngestionMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed document and the number of chunks stored for it.
    pub fn record_document(&self, chunk_count: u64) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
        self.chunks_stored.fetch_add(chunk_count, Ordering::Relaxed);
        self.last_chunk_count.store(chunk_count, Ordering::Relaxed);
    }

    /// Record a job that reached the terminal `FAILED` state.
    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job scheduled for another attempt after a transient error.
    pub fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job pushed back because its document lock was held elsewhere.
    pub fn record_contention(&self) {
        self.contention_requeues.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let documents_ingested = self.documents_ingested.load(Ordering::Relaxed);
        MetricsSnapshot {
            documents_ingested,
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            contention_requeues: self.contention_requeues.load(Ordering::Relaxed),
            last_chunk_count: (documents_ingested > 0)
                .then(|| self.last_chunk_count.load(Ordering::Relaxed)),
        }
    }
}

/// Immutable view of ingestion counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Number of documents ingested since startup.
    pub documents_ingested: u64,
    /// Total chunk count stored across all ingested documents.
    pub chunks_stored: u64,
    /// Jobs that ended in `FAILED`.
    pub jobs_failed: u64,
    /// Retries scheduled after transient errors.
    pub jobs_retried: u64,
    /// Jobs requeued because another worker held the document lock.
    pub contention_requeues: u64,
    /// Chunk count of the most recently completed document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk_count: Option<u64>,
}
