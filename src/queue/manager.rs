use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::journal::{QueueJournal, unix_ms};
use super::{
    EnqueueOptions, EnqueuedJob, JobPayload, JobState, QueueError, QueueMetrics, QueueName,
    QueuedJob,
};

/// Finished job records kept per queue for [`QueueManager::get_job`].
const FINISHED_RETENTION: usize = 1_000;

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    active: HashSet<String>,
    finished: VecDeque<String>,
    pending_documents: HashMap<String, String>,
    completed_total: u64,
    failed_total: u64,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = Vec::new();
        self.delayed.retain(|(ready_at, id)| {
            if *ready_at <= now {
                due.push((*ready_at, id.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(ready_at, _)| *ready_at);
        self.waiting.extend(due.into_iter().map(|(_, id)| id));
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|(ready_at, _)| *ready_at).min()
    }
}

#[derive(Default)]
struct Inner {
    open: bool,
    restored: bool,
    queues: HashMap<QueueName, QueueState>,
    jobs: HashMap<String, QueuedJob>,
}

impl Inner {
    fn queue(&mut self, name: QueueName) -> &mut QueueState {
        self.queues.entry(name).or_default()
    }

    fn active_job(&mut self, job_id: &str) -> Result<&mut QueuedJob, QueueError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        if job.state != JobState::Active {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                state: job.state,
            });
        }
        Ok(job)
    }

    fn finish(&mut self, job_id: &str, state: JobState, error: Option<String>) -> Result<(), QueueError> {
        let job = self.active_job(job_id)?;
        job.state = state;
        if error.is_some() {
            job.last_error = error;
        }
        let queue_name = job.queue;
        let document_id = job.payload.document_id().to_string();

        let queue = self.queue(queue_name);
        queue.active.remove(job_id);
        if queue.pending_documents.get(&document_id).map(String::as_str) == Some(job_id) {
            queue.pending_documents.remove(&document_id);
        }
        match state {
            JobState::Completed => queue.completed_total += 1,
            _ => queue.failed_total += 1,
        }
        queue.finished.push_back(job_id.to_string());
        let evicted = if queue.finished.len() > FINISHED_RETENTION {
            queue.finished.pop_front()
        } else {
            None
        };
        if let Some(evicted) = evicted {
            self.jobs.remove(&evicted);
        }
        Ok(())
    }

    /// Move an active job to the delayed set. Returns the job and its wall-clock ready time.
    fn reschedule(
        &mut self,
        job_id: &str,
        delay: Duration,
        refund_attempt: bool,
    ) -> Result<(QueuedJob, i64), QueueError> {
        let job = self.active_job(job_id)?;
        job.state = JobState::Delayed;
        if refund_attempt {
            job.attempts_made = job.attempts_made.saturating_sub(1);
        }
        let snapshot = job.clone();
        let queue = self.queue(snapshot.queue);
        queue.active.remove(job_id);
        queue.delayed.push((Instant::now() + delay, job_id.to_string()));
        Ok((snapshot, unix_ms(OffsetDateTime::now_utc() + delay)))
    }

    /// Rebuild queue state from journalled rows, in enqueue order.
    fn restore(&mut self, rows: Vec<super::journal::JournalRow>) -> usize {
        let now_ms = unix_ms(OffsetDateTime::now_utc());
        let restored = rows.len();
        for row in rows {
            let job = row.job;
            let id = job.id.clone();
            let queue = self.queue(job.queue);
            queue
                .pending_documents
                .insert(job.payload.document_id().to_string(), id.clone());
            match job.state {
                JobState::Active => {
                    queue.active.insert(id.clone());
                }
                JobState::Delayed => {
                    let remaining = row.ready_at_ms.map_or(0, |ready| ready - now_ms).max(0);
                    let ready_at = Instant::now() + Duration::from_millis(remaining.unsigned_abs());
                    queue.delayed.push((ready_at, id.clone()));
                }
                _ => queue.waiting.push_back(id.clone()),
            }
            self.jobs.insert(id, job);
        }
        restored
    }
}

/// Job queues with delayed scheduling and pull-based consumption.
///
/// Scheduling happens in memory; every unfinished job is also journalled to SQLite and read
/// back the first time the queues are opened. Consumers call [`QueueManager::dequeue`] in a
/// loop; it parks until a job is ready, the consumer's token is cancelled, or the queues are
/// closed.
pub struct QueueManager {
    inner: Mutex<Inner>,
    journal: QueueJournal,
    file_ingestion_ready: Notify,
    embeddings_ready: Notify,
    closed: Mutex<CancellationToken>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    /// Closed queues journalled to a private in-memory database. Jobs do not survive the
    /// process; use [`Self::open`] for that.
    pub fn new() -> Self {
        Self::with_journal(QueueJournal::in_memory())
    }

    /// Closed queues journalled to the SQLite database at `url`, such as
    /// `sqlite://rusty-ingest-queue.db`. The file is created on first use.
    pub fn open(url: &str) -> Result<Self, QueueError> {
        Ok(Self::with_journal(QueueJournal::connect(url)?))
    }

    fn with_journal(journal: QueueJournal) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            journal,
            file_ingestion_ready: Notify::new(),
            embeddings_ready: Notify::new(),
            closed: Mutex::new(CancellationToken::new()),
        }
    }

    fn ready(&self, queue: QueueName) -> &Notify {
        match queue {
            QueueName::FileIngestion => &self.file_ingestion_ready,
            QueueName::Embeddings => &self.embeddings_ready,
        }
    }

    /// Open the queues for work.
    ///
    /// The first call restores jobs journalled by a previous process; jobs it left active stay
    /// active until [`Self::recover_active`] returns them. Reopening after [`Self::close`]
    /// keeps existing jobs.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.open {
            return Ok(());
        }
        if !inner.restored {
            self.journal.migrate().await?;
            let rows = self.journal.load().await?;
            let restored = inner.restore(rows);
            inner.restored = true;
            if restored > 0 {
                tracing::info!(restored, "Restored queued jobs from journal");
            }
        }
        inner.open = true;
        for queue in QueueName::ALL {
            inner.queue(queue);
        }
        *self.closed.lock().await = CancellationToken::new();
        drop(inner);

        for queue in QueueName::ALL {
            self.ready(queue).notify_waiters();
        }
        tracing::info!(queues = ?QueueName::ALL, "Queues initialized");
        Ok(())
    }

    /// Stop accepting work and wake every parked consumer.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.open {
            return;
        }
        inner.open = false;
        self.closed.lock().await.cancel();
        tracing::info!("Queues closed");
    }

    /// Whether the queues accept work.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.open
    }

    /// Add a job. With deduplication, a document that already has a waiting, delayed, or
    /// active job on the same queue gets that job back instead.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueuedJob, QueueError> {
        if payload.queue() != queue {
            return Err(QueueError::PayloadMismatch {
                queue,
                payload: payload.queue(),
            });
        }

        let mut inner = self.inner.lock().await;
        if !inner.open {
            return Err(QueueError::Closed);
        }

        let document_id = payload.document_id().to_string();
        if options.deduplicate
            && let Some(existing) = inner.queue(queue).pending_documents.get(&document_id)
        {
            tracing::debug!(%queue, document_id, job_id = %existing, "Enqueue deduplicated");
            return Ok(EnqueuedJob {
                id: existing.clone(),
                deduplicated: true,
            });
        }

        let id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if inner.jobs.contains_key(&id) {
            return Ok(EnqueuedJob {
                id,
                deduplicated: true,
            });
        }

        let delayed = options.delay.filter(|delay| !delay.is_zero());
        let enqueued_at = OffsetDateTime::now_utc();
        let job = QueuedJob {
            id: id.clone(),
            queue,
            payload: Arc::new(payload),
            attempts_made: 0,
            state: if delayed.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            enqueued_at,
            last_error: None,
        };
        self.journal
            .insert(&job, delayed.map(|delay| unix_ms(enqueued_at + delay)))
            .await?;
        inner.jobs.insert(id.clone(), job);

        let state = inner.queue(queue);
        state.pending_documents.insert(document_id.clone(), id.clone());
        match delayed {
            Some(delay) => state.delayed.push((Instant::now() + delay, id.clone())),
            None => state.waiting.push_back(id.clone()),
        }
        drop(inner);

        self.ready(queue).notify_one();
        tracing::debug!(%queue, document_id, job_id = %id, "Job enqueued");
        Ok(EnqueuedJob {
            id,
            deduplicated: false,
        })
    }

    /// Wait for the next ready job and mark it active, counting one attempt.
    ///
    /// Returns `None` once `cancel` fires or the queues are closed.
    pub async fn dequeue(&self, queue: QueueName, cancel: &CancellationToken) -> Option<QueuedJob> {
        let closed = self.closed.lock().await.clone();
        loop {
            let notified = self.ready(queue).notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready_at = {
                let mut inner = self.inner.lock().await;
                if !inner.open || cancel.is_cancelled() {
                    return None;
                }
                let popped = {
                    let state = inner.queue(queue);
                    state.promote_due(Instant::now());
                    state.waiting.pop_front().ok_or_else(|| state.next_ready_at())
                };
                match popped {
                    Ok(id) => {
                        let Some(job) = inner.jobs.get_mut(&id) else {
                            tracing::warn!(%queue, job_id = %id, "Waiting job has no record; skipping it");
                            continue;
                        };
                        job.state = JobState::Active;
                        job.attempts_made += 1;
                        let job = job.clone();
                        inner.queue(queue).active.insert(id);
                        if let Err(error) = self.journal.update(&job, None).await {
                            tracing::warn!(job_id = %job.id, error = %error, "Failed to journal job start");
                        }
                        return Some(job);
                    }
                    Err(next_ready_at) => next_ready_at,
                }
            };

            let sleep = async {
                match next_ready_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = closed.cancelled() => return None,
                _ = &mut notified => {}
                _ = sleep => {}
            }
        }
    }

    /// Mark an active job as finished successfully.
    pub async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.finish(job_id, JobState::Completed, None)?;
        self.journal.remove(job_id).await
    }

    /// Mark an active job as finished unsuccessfully.
    pub async fn fail(&self, job_id: &str, error: impl Into<String>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        inner.finish(job_id, JobState::Failed, Some(error.into()))?;
        self.journal.remove(job_id).await
    }

    /// Schedule another attempt of an active job after `delay`.
    pub async fn retry(
        &self,
        job_id: &str,
        delay: Duration,
        error: impl Into<String>,
    ) -> Result<(), QueueError> {
        let queue = {
            let mut inner = self.inner.lock().await;
            inner.active_job(job_id)?.last_error = Some(error.into());
            let (job, ready_at_ms) = inner.reschedule(job_id, delay, false)?;
            self.journal.update(&job, Some(ready_at_ms)).await?;
            job.queue
        };
        self.ready(queue).notify_one();
        Ok(())
    }

    /// Push an active job back without consuming an attempt (lock contention).
    pub async fn requeue_delayed(&self, job_id: &str, delay: Duration) -> Result<(), QueueError> {
        let queue = {
            let mut inner = self.inner.lock().await;
            let (job, ready_at_ms) = inner.reschedule(job_id, delay, true)?;
            self.journal.update(&job, Some(ready_at_ms)).await?;
            job.queue
        };
        self.ready(queue).notify_one();
        Ok(())
    }

    /// Current snapshot of a job, if still retained.
    pub async fn get_job(&self, job_id: &str) -> Option<QueuedJob> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    /// Counts for one queue.
    pub async fn get_queue_metrics(&self, queue: QueueName) -> QueueMetrics {
        let mut inner = self.inner.lock().await;
        let state = inner.queue(queue);
        state.promote_due(Instant::now());
        QueueMetrics {
            waiting: state.waiting.len(),
            active: state.active.len(),
            completed: state.completed_total,
            failed: state.failed_total,
            delayed: state.delayed.len(),
        }
    }

    /// Counts for every queue, keyed by wire name.
    pub async fn get_all_queue_metrics(&self) -> BTreeMap<&'static str, QueueMetrics> {
        let mut metrics = BTreeMap::new();
        for queue in QueueName::ALL {
            metrics.insert(queue.as_str(), self.get_queue_metrics(queue).await);
        }
        metrics
    }

    /// Move jobs left active by stopped consumers, or by a previous process, back to the
    /// front of their queues. The interrupted attempt is not counted.
    pub async fn recover_active(&self) -> usize {
        let mut recovered = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for queue in QueueName::ALL {
                let state = inner.queue(queue);
                let ids: Vec<String> = state.active.drain().collect();
                for id in ids.iter().rev() {
                    state.waiting.push_front(id.clone());
                }
                recovered.extend(ids.into_iter().map(|id| (queue, id)));
            }
            for (_, id) in &recovered {
                let Some(job) = inner.jobs.get_mut(id) else {
                    continue;
                };
                job.state = JobState::Waiting;
                job.attempts_made = job.attempts_made.saturating_sub(1);
                if let Err(error) = self.journal.update(job, None).await {
                    tracing::warn!(job_id = %id, error = %error, "Failed to journal recovered job");
                }
            }
        }
        for (queue, _) in &recovered {
            self.ready(*queue).notify_one();
        }
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "Recovered active jobs");
        }
        recovered.len()
    }
}
