use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{Job, JobBroker, JobStatus, ProgressEvent};

/// Redis keys structure:
/// - mindloom:jobs:{id}                   - String for job data (JSON)
/// - mindloom:jobs:{queue}:waiting        - List of claimable job ids (FIFO)
/// - mindloom:jobs:{queue}:delayed        - ZSet of retry-scheduled ids, scored by ready-at (ms)
/// - mindloom:jobs:{queue}:completed      - ZSet of completed ids, scored by finish time (ms)
/// - mindloom:jobs:{queue}:failed         - ZSet of terminally failed ids, scored by finish time (ms)
/// - mindloom:jobs:{queue}:dedup:{token}  - String holding the de-duplicated job id
const JOB_PREFIX: &str = "mindloom:jobs:";

/// Redis-backed job broker
pub struct RedisBroker {
    conn: RedisConnectionManager,
    closed: AtomicBool,
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

impl RedisBroker {
    pub fn new(conn: RedisConnectionManager) -> Self {
        Self {
            conn,
            closed: AtomicBool::new(false),
        }
    }

    fn job_key(job_id: Uuid) -> String {
        format!("{}{}", JOB_PREFIX, job_id)
    }

    fn waiting_key(queue: &str) -> String {
        format!("{}{}:waiting", JOB_PREFIX, queue)
    }

    fn delayed_key(queue: &str) -> String {
        format!("{}{}:delayed", JOB_PREFIX, queue)
    }

    fn completed_key(queue: &str) -> String {
        format!("{}{}:completed", JOB_PREFIX, queue)
    }

    fn failed_key(queue: &str) -> String {
        format!("{}{}:failed", JOB_PREFIX, queue)
    }

    fn dedup_key(queue: &str, token: &str) -> String {
        format!("{}{}:dedup:{}", JOB_PREFIX, queue, token)
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let job_json = serde_json::to_string(job)?;

        let _: () = conn.set(Self::job_key(job.id), &job_json).await?;

        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        let mut conn = self.conn.clone();

        let job_json: Option<String> = conn.get(Self::job_key(job_id)).await?;

        match job_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Move retry-scheduled jobs whose ready time has passed back into the
    /// waiting list. ZREM decides which worker wins a promotion race.
    async fn promote_due(&self, queue: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let delayed_key = Self::delayed_key(queue);

        let due: Vec<String> = conn.zrangebyscore(&delayed_key, "-inf", now_ms()).await?;

        for job_id in due {
            let removed: i64 = conn.zrem(&delayed_key, &job_id).await?;
            if removed == 1 {
                let _: () = conn.rpush(Self::waiting_key(queue), &job_id).await?;
            }
        }

        Ok(())
    }

    /// Trim a finished-jobs index by count and/or age, deleting the expired
    /// job records themselves.
    async fn trim_finished(
        &self,
        index_key: &str,
        keep_count: Option<u32>,
        keep_secs: u64,
    ) -> AppResult<()> {
        let mut conn = self.conn.clone();

        if let Some(keep) = keep_count {
            let count: u64 = conn.zcard(index_key).await?;
            if count > keep as u64 {
                let overflow = (count - keep as u64) as isize;
                let oldest: Vec<(String, f64)> = conn.zpopmin(index_key, overflow).await?;
                for (job_id, _) in oldest {
                    let _: () = conn.del(format!("{}{}", JOB_PREFIX, job_id)).await?;
                }
            }
        }

        let cutoff = now_ms() - (keep_secs as i64) * 1000;
        let expired: Vec<String> = conn.zrangebyscore(index_key, "-inf", cutoff).await?;
        if !expired.is_empty() {
            for job_id in &expired {
                let _: () = conn.del(format!("{}{}", JOB_PREFIX, job_id)).await?;
            }
            let _: () = conn.zrembyscore(index_key, "-inf", cutoff).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn submit(&self, job: Job) -> AppResult<Uuid> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Queue("broker is closed".to_string()));
        }

        let mut conn = self.conn.clone();
        let job_id = job.id;
        let queue = job.queue.clone();

        if let Some(token) = &job.dedup_id {
            let dedup_key = Self::dedup_key(&queue, token);
            let reserved: bool = conn.set_nx(&dedup_key, job_id.to_string()).await?;
            if !reserved {
                let existing: Option<String> = conn.get(&dedup_key).await?;
                if let Some(existing_id) = existing {
                    let existing_id = Uuid::parse_str(&existing_id)
                        .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?;
                    // The token may outlive a job removed by retention
                    if self.load_job(existing_id).await?.is_some() {
                        tracing::info!(job_id = %existing_id, queue = %queue, "Duplicate submission, returning existing job");
                        return Ok(existing_id);
                    }
                    let _: () = conn.set(&dedup_key, job_id.to_string()).await?;
                }
            }
            // The token expires with the longest-lived record it can point at
            let ttl = job.retention.completed_keep_secs.max(job.retention.failed_keep_secs);
            let _: () = conn.expire(&dedup_key, ttl as i64).await?;
        }

        self.save_job(&job).await?;

        let _: () = conn.rpush(Self::waiting_key(&queue), job_id.to_string()).await?;

        tracing::info!(job_id = %job_id, queue = %queue, "Job submitted");

        Ok(job_id)
    }

    async fn claim(&self, queue: &str, timeout: Duration) -> AppResult<Option<Job>> {
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();

        // Blocking pop from the waiting list
        let result: Option<(String, String)> = conn
            .blpop(Self::waiting_key(queue), timeout.as_secs_f64())
            .await?;

        if let Some((_, job_id_str)) = result {
            let job_id = Uuid::parse_str(&job_id_str)
                .map_err(|e| AppError::Internal(format!("Invalid UUID: {}", e)))?;

            // Retention may have dropped the record between push and pop
            if let Some(mut job) = self.load_job(job_id).await? {
                job.status = JobStatus::Active;
                job.attempts_made += 1;
                job.started_at = Some(OffsetDateTime::now_utc());
                self.save_job(&job).await?;

                tracing::info!(job_id = %job_id, queue, attempt = job.attempts_made, "Job claimed");
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        self.load_job(job_id).await
    }

    async fn report_progress(&self, job_id: Uuid, event: ProgressEvent) -> AppResult<()> {
        let mut job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

        job.progress = Some(event);
        self.save_job(&job).await?;

        Ok(())
    }

    async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> AppResult<()> {
        let mut job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.finished_at = Some(OffsetDateTime::now_utc());
        self.save_job(&job).await?;

        let mut conn = self.conn.clone();
        let completed_key = Self::completed_key(&job.queue);
        let _: () = conn.zadd(&completed_key, job_id.to_string(), now_ms()).await?;

        self.trim_finished(
            &completed_key,
            Some(job.retention.completed_keep_count),
            job.retention.completed_keep_secs,
        )
        .await?;

        tracing::info!(job_id = %job_id, queue = %job.queue, "Job completed");

        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: String) -> AppResult<()> {
        let mut job = self
            .load_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

        job.error_message = Some(error.clone());
        let mut conn = self.conn.clone();

        if job.has_attempts_left() {
            job.status = JobStatus::Waiting;
            self.save_job(&job).await?;

            let delay = job.backoff.delay_for(job.attempts_made);
            let ready_at = now_ms() + delay.as_millis() as i64;
            let _: () = conn
                .zadd(Self::delayed_key(&job.queue), job_id.to_string(), ready_at)
                .await?;

            tracing::warn!(
                job_id = %job_id,
                queue = %job.queue,
                attempts_made = job.attempts_made,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, retry scheduled"
            );
        } else {
            job.status = JobStatus::Failed;
            job.finished_at = Some(OffsetDateTime::now_utc());
            self.save_job(&job).await?;

            let failed_key = Self::failed_key(&job.queue);
            let _: () = conn.zadd(&failed_key, job_id.to_string(), now_ms()).await?;

            self.trim_finished(&failed_key, None, job.retention.failed_keep_secs)
                .await?;

            tracing::warn!(job_id = %job_id, queue = %job.queue, error = %error, "Job terminally failed");
        }

        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(Self::waiting_key(queue)).await?;
        Ok(len)
    }

    async fn close(&self) -> AppResult<()> {
        // The managed connection is released on drop; refusing new
        // submissions is what ordering-sensitive shutdown needs here.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
