//! Queue consumers binding dequeued jobs to the ingestion worker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::IngestionMetrics;
use crate::queue::{JobPayload, QueueManager, QueueName, QueuedJob};
use crate::vector_store::VectorStoreService;

use super::retry::Disposition;
use super::types::{IngestionError, IngestionSummary};
use super::worker::{IngestionWorker, JobContext};

/// Errors raised while starting or stopping consumers.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// In-flight jobs did not finish within the shutdown timeout.
    #[error("{in_flight} job(s) still running after {timeout:?}")]
    ShutdownTimedOut {
        /// Jobs still running when the timeout elapsed.
        in_flight: usize,
        /// Timeout that elapsed.
        timeout: Duration,
    },
}

/// Consumer pool sizes and shutdown budget.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProcessorSettings {
    /// Consumers on the `fileIngestion` queue.
    pub file_ingestion_concurrency: usize,
    /// Consumers on the `embeddings` queue.
    pub embeddings_concurrency: usize,
    /// How long [`JobProcessor::stop_processing`] waits for in-flight jobs.
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

impl ProcessorSettings {
    fn concurrency(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::FileIngestion => self.file_ingestion_concurrency,
            QueueName::Embeddings => self.embeddings_concurrency,
        }
        .max(1)
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            file_ingestion_concurrency: 2,
            embeddings_concurrency: 2,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct InFlight {
    file_ingestion: AtomicUsize,
    embeddings: AtomicUsize,
}

impl InFlight {
    fn counter(&self, queue: QueueName) -> &AtomicUsize {
        match queue {
            QueueName::FileIngestion => &self.file_ingestion,
            QueueName::Embeddings => &self.embeddings,
        }
    }

    fn total(&self) -> usize {
        QueueName::ALL
            .iter()
            .map(|queue| self.counter(*queue).load(Ordering::SeqCst))
            .sum()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Shared {
    worker: Arc<IngestionWorker>,
    queues: Arc<QueueManager>,
    store: VectorStoreService,
    metrics: Arc<IngestionMetrics>,
    in_flight: InFlight,
}

struct Consumers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Runs a bounded pool of consumers per queue.
pub struct JobProcessor {
    shared: Arc<Shared>,
    settings: ProcessorSettings,
    consumers: Mutex<Option<Consumers>>,
}

impl JobProcessor {
    /// Build a processor; no consumers run until [`Self::force_restart_processing`].
    pub fn new(
        worker: Arc<IngestionWorker>,
        queues: Arc<QueueManager>,
        store: VectorStoreService,
        metrics: Arc<IngestionMetrics>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker,
                queues,
                store,
                metrics,
                in_flight: InFlight::default(),
            }),
            settings,
            consumers: Mutex::new(None),
        }
    }

    /// Pool sizes and shutdown budget.
    pub fn settings(&self) -> ProcessorSettings {
        self.settings
    }

    /// Whether consumers are running.
    pub async fn is_running(&self) -> bool {
        self.consumers.lock().await.is_some()
    }

    /// Jobs currently executing, keyed by queue name.
    pub fn in_flight(&self) -> BTreeMap<&'static str, usize> {
        QueueName::ALL
            .iter()
            .map(|queue| {
                (
                    queue.as_str(),
                    self.shared.in_flight.counter(*queue).load(Ordering::SeqCst),
                )
            })
            .collect()
    }

    /// Stop any running consumers, return orphaned active jobs to their queues, and spawn a
    /// fresh pool.
    pub async fn force_restart_processing(&self) -> Result<(), ProcessorError> {
        if let Err(error) = self.stop_processing().await {
            tracing::warn!(error = %error, "Restarting while previous jobs are still running");
        }

        if self.shared.in_flight.total() == 0 {
            self.shared.queues.recover_active().await;
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            for index in 0..self.settings.concurrency(queue) {
                let shared = self.shared.clone();
                let cancel = cancel.clone();
                handles.push(tokio::spawn(async move {
                    shared.consume(queue, index, cancel).await;
                }));
            }
        }
        tracing::info!(
            file_ingestion = self.settings.concurrency(QueueName::FileIngestion),
            embeddings = self.settings.concurrency(QueueName::Embeddings),
            "Job consumers started"
        );
        *self.consumers.lock().await = Some(Consumers { cancel, handles });
        Ok(())
    }

    /// Stop pulling new jobs and wait for in-flight ones, up to the shutdown timeout.
    ///
    /// Running jobs are never aborted; on timeout they keep running detached.
    pub async fn stop_processing(&self) -> Result<(), ProcessorError> {
        let Some(Consumers { cancel, handles }) = self.consumers.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        tracing::info!(
            in_flight = self.shared.in_flight.total(),
            "Stopping job consumers"
        );

        let timeout = self.settings.shutdown_timeout;
        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(error) = result {
                        tracing::error!(error = %error, "Consumer task ended abnormally");
                    }
                }
                tracing::info!("Job consumers stopped");
                Ok(())
            }
            Err(_) => Err(ProcessorError::ShutdownTimedOut {
                in_flight: self.shared.in_flight.total(),
                timeout,
            }),
        }
    }
}

impl Shared {
    async fn consume(self: Arc<Self>, queue: QueueName, index: usize, cancel: CancellationToken) {
        tracing::debug!(%queue, consumer = index, "Consumer started");
        while let Some(job) = self.queues.dequeue(queue, &cancel).await {
            self.handle(job).await;
        }
        tracing::debug!(%queue, consumer = index, "Consumer stopped");
    }

    async fn handle(&self, job: QueuedJob) {
        let _in_flight = InFlightGuard::enter(self.in_flight.counter(job.queue));
        let ctx = JobContext {
            job_id: job.id.clone(),
            attempt: job.attempts_made,
        };
        tracing::debug!(queue = %job.queue, job_id = %job.id, attempt = ctx.attempt, "Job started");

        // A panicking job must not take its consumer down with it.
        let worker = self.worker.clone();
        let payload = job.payload.clone();
        let attempt = ctx.clone();
        let outcome = match tokio::spawn(async move {
            match payload.as_ref() {
                JobPayload::FileIngestion(data) => worker.process_file(&attempt, data).await,
                JobPayload::Embeddings(data) => worker.process_embeddings(&attempt, data).await,
            }
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(join_error) => {
                tracing::error!(job_id = %job.id, error = %join_error, "Job aborted");
                let error = IngestionError::Transient {
                    stage: "worker",
                    message: join_error.to_string(),
                };
                self.worker.record_abort(&ctx, &job.payload, &error).await;
                Err(error)
            }
        };

        self.settle(&job, outcome).await;
    }

    async fn settle(&self, job: &QueuedJob, outcome: Result<IngestionSummary, IngestionError>) {
        let (agent_id, user_id) = job.payload.owner();
        let queue_result = match outcome {
            Ok(summary) => {
                if !summary.deferred {
                    self.store.invalidate(agent_id, user_id).await;
                }
                self.queues.complete(&job.id).await
            }
            Err(error) => {
                let policy = self.worker.retry_policy();
                match policy.disposition(error.kind(), job.attempts_made) {
                    Disposition::Requeue(delay) => {
                        self.metrics.record_contention();
                        self.queues.requeue_delayed(&job.id, delay).await
                    }
                    Disposition::Retry(delay) => {
                        self.metrics.record_retry();
                        tracing::info!(
                            job_id = %job.id,
                            attempt = job.attempts_made,
                            delay_ms = delay.as_millis() as u64,
                            "Job scheduled for retry"
                        );
                        self.queues.retry(&job.id, delay, error.to_string()).await
                    }
                    Disposition::Fail => {
                        self.metrics.record_failure();
                        self.store.invalidate(agent_id, user_id).await;
                        self.queues.fail(&job.id, error.to_string()).await
                    }
                }
            }
        };
        if let Err(error) = queue_result {
            tracing::warn!(job_id = %job.id, error = %error, "Failed to settle job");
        }
    }
}
