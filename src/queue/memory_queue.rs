use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{Job, JobBroker, JobStatus, ProgressEvent};

/// Slice used while waiting so delayed retries become claimable without a
/// dedicated timer per job.
const CLAIM_POLL_SLICE: Duration = Duration::from_millis(20);

/// In-memory broker with the same semantics as the Redis one.
///
/// Used by the test suites so they run without a live broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

struct Inner {
    jobs: HashMap<Uuid, Job>,
    waiting: HashMap<String, VecDeque<Uuid>>,
    /// Retry-scheduled jobs: (ready_at, id), promoted on claim
    delayed: HashMap<String, Vec<(OffsetDateTime, Uuid)>>,
    /// Finish-ordered ids per queue, trimmed per retention
    completed: HashMap<String, VecDeque<(OffsetDateTime, Uuid)>>,
    failed: HashMap<String, VecDeque<(OffsetDateTime, Uuid)>>,
    /// (queue, token) -> job id
    dedup: HashMap<(String, String), Uuid>,
    closed: bool,
}

impl Inner {
    /// Move delayed jobs whose ready time has passed into the waiting list.
    fn promote_due(&mut self, queue: &str, now: OffsetDateTime) {
        let due: Vec<Uuid> = match self.delayed.get_mut(queue) {
            Some(delayed) => {
                delayed.sort_by_key(|(ready_at, _)| *ready_at);
                let n = delayed
                    .iter()
                    .take_while(|(ready_at, _)| *ready_at <= now)
                    .count();
                delayed.drain(..n).map(|(_, job_id)| job_id).collect()
            }
            None => return,
        };

        if !due.is_empty() {
            self.waiting.entry(queue.to_string()).or_default().extend(due);
        }
    }

    fn remove_job(&mut self, job_id: Uuid) {
        if let Some(job) = self.jobs.remove(&job_id) {
            if let Some(token) = job.dedup_id {
                self.dedup.remove(&(job.queue, token));
            }
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                jobs: HashMap::new(),
                waiting: HashMap::new(),
                delayed: HashMap::new(),
                completed: HashMap::new(),
                failed: HashMap::new(),
                dedup: HashMap::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    async fn submit(&self, job: Job) -> AppResult<Uuid> {
        let job_id = job.id;
        let queue = job.queue.clone();

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(AppError::Queue("broker is closed".to_string()));
        }

        if let Some(token) = &job.dedup_id {
            let key = (queue.clone(), token.clone());
            if let Some(existing_id) = inner.dedup.get(&key).copied() {
                if inner.jobs.contains_key(&existing_id) {
                    tracing::info!(job_id = %existing_id, queue = %queue, "Duplicate submission, returning existing job");
                    return Ok(existing_id);
                }
            }
            inner.dedup.insert(key, job_id);
        }

        inner.jobs.insert(job_id, job);
        inner.waiting.entry(queue.clone()).or_default().push_back(job_id);
        drop(inner);
        self.notify.notify_one();

        tracing::info!(job_id = %job_id, queue = %queue, "Job submitted");

        Ok(job_id)
    }

    async fn claim(&self, queue: &str, timeout: Duration) -> AppResult<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let mut inner = self.inner.lock().await;
                let now = OffsetDateTime::now_utc();
                inner.promote_due(queue, now);

                if let Some(job_id) = inner.waiting.get_mut(queue).and_then(|q| q.pop_front()) {
                    // Retention may have dropped the record; skip stale ids
                    if let Some(job) = inner.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Active;
                        job.attempts_made += 1;
                        job.started_at = Some(now);
                        tracing::info!(job_id = %job_id, queue, attempt = job.attempts_made, "Job claimed");
                        return Ok(Some(job.clone()));
                    }
                    continue;
                }

                if inner.closed {
                    return Ok(None);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = std::cmp::min(deadline - now, CLAIM_POLL_SLICE);

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn report_progress(&self, job_id: Uuid, event: ProgressEvent) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;
        job.progress = Some(event);
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.finished_at = Some(now);
        let queue = job.queue.clone();
        let retention = job.retention;

        let finished = inner.completed.entry(queue.clone()).or_default();
        finished.push_back((now, job_id));

        // Count-based trim, oldest first
        let mut expired: Vec<Uuid> = Vec::new();
        while finished.len() > retention.completed_keep_count as usize {
            if let Some((_, old_id)) = finished.pop_front() {
                expired.push(old_id);
            }
        }
        // Age-based trim
        let cutoff = now - time::Duration::seconds(retention.completed_keep_secs as i64);
        while matches!(finished.front(), Some((at, _)) if *at <= cutoff) {
            if let Some((_, old_id)) = finished.pop_front() {
                expired.push(old_id);
            }
        }
        for old_id in expired {
            inner.remove_job(old_id);
        }

        tracing::info!(job_id = %job_id, queue = %queue, "Job completed");

        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: String) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

        job.error_message = Some(error.clone());
        let queue = job.queue.clone();

        if job.has_attempts_left() {
            job.status = JobStatus::Waiting;
            let delay = job.backoff.delay_for(job.attempts_made);
            let ready_at = now + delay;
            let attempts_made = job.attempts_made;
            let max_attempts = job.max_attempts;

            inner.delayed.entry(queue.clone()).or_default().push((ready_at, job_id));
            drop(inner);
            self.notify.notify_one();

            tracing::warn!(
                job_id = %job_id,
                queue = %queue,
                attempts_made,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, retry scheduled"
            );
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            let retention = job.retention;

            let failed = inner.failed.entry(queue.clone()).or_default();
            failed.push_back((now, job_id));

            let cutoff = now - time::Duration::seconds(retention.failed_keep_secs as i64);
            let mut expired: Vec<Uuid> = Vec::new();
            while matches!(failed.front(), Some((at, _)) if *at <= cutoff) {
                if let Some((_, old_id)) = failed.pop_front() {
                    expired.push(old_id);
                }
            }
            for old_id in expired {
                inner.remove_job(old_id);
            }

            tracing::warn!(job_id = %job_id, queue = %queue, error = %error, "Job terminally failed");
        }

        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> AppResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.waiting.get(queue).map_or(0, |q| q.len()) as u64)
    }

    async fn close(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }
}
