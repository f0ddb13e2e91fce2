pub mod connection;
pub mod job;
pub mod memory_queue;
pub mod redis_queue;

pub use connection::BrokerConfig;
pub use job::{BackoffPolicy, Job, JobStatus, ProgressEvent, RetentionPolicy, SubmitOptions};
pub use memory_queue::InMemoryBroker;
pub use redis_queue::RedisBroker;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::contracts::JobKind;
use crate::error::AppResult;

/// Durable broker operations the orchestration layer relies on.
///
/// The broker owns job-record durability and the waiting/retry bookkeeping;
/// workers drive the terminal transitions through `complete`/`fail`.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Persist and enqueue a job. Returns immediately with the job id;
    /// never waits for execution.
    async fn submit(&self, job: Job) -> AppResult<Uuid>;

    /// Claim the next waiting job for `queue`, blocking up to `timeout`.
    /// Claiming marks the job active and consumes one attempt.
    async fn claim(&self, queue: &str, timeout: Duration) -> AppResult<Option<Job>>;

    /// Get a job record by id
    async fn job(&self, job_id: Uuid) -> AppResult<Option<Job>>;

    /// Attach the latest progress snapshot to an in-flight job
    async fn report_progress(&self, job_id: Uuid, event: ProgressEvent) -> AppResult<()>;

    /// Mark a job completed with its result payload and apply retention
    async fn complete(&self, job_id: Uuid, result: serde_json::Value) -> AppResult<()>;

    /// Mark an execution failed: re-queues after the backoff delay while
    /// attempts remain, otherwise terminally fails the job.
    async fn fail(&self, job_id: Uuid, error: String) -> AppResult<()>;

    /// Number of jobs currently claimable from `queue`
    async fn queue_depth(&self, queue: &str) -> AppResult<u64>;

    /// Stop accepting submissions and release broker resources. Idempotent.
    async fn close(&self) -> AppResult<()>;
}

/// Typed port bound to exactly one job kind.
///
/// Producers submit through this; the API layer polls `snapshot` by job id.
pub struct Queue<K: JobKind> {
    broker: Arc<dyn JobBroker>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: JobKind> Clone for Queue<K> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: JobKind> Queue<K> {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self {
            broker,
            _kind: PhantomData,
        }
    }

    pub fn broker(&self) -> Arc<dyn JobBroker> {
        self.broker.clone()
    }

    /// Submit a job with the kind's default options. Fire-and-forget: the
    /// returned id can be polled while the job runs.
    pub async fn submit(&self, payload: K::Payload) -> AppResult<Uuid> {
        self.submit_with(payload, K::default_options()).await
    }

    pub async fn submit_with(&self, payload: K::Payload, options: SubmitOptions) -> AppResult<Uuid> {
        let payload = serde_json::to_value(&payload)?;
        let job = Job::new(K::QUEUE_NAME, payload, &options);
        self.broker.submit(job).await
    }

    /// Status-polling view of one job. `None` when the id is unknown or
    /// belongs to a different queue.
    pub async fn snapshot(&self, job_id: Uuid) -> AppResult<Option<JobSnapshot<K>>> {
        let Some(job) = self.broker.job(job_id).await? else {
            return Ok(None);
        };
        if job.queue != K::QUEUE_NAME {
            return Ok(None);
        }

        let result = match (&job.status, &job.result) {
            (JobStatus::Completed, Some(value)) => Some(serde_json::from_value(value.clone())?),
            _ => None,
        };

        Ok(Some(JobSnapshot {
            status: job.status,
            progress: job.progress,
            result,
            error_message: job.error_message,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
        }))
    }

    pub async fn depth(&self) -> AppResult<u64> {
        self.broker.queue_depth(K::QUEUE_NAME).await
    }
}

/// Polling view of one job. `result` is present only once the job completed.
#[derive(Debug, Clone)]
pub struct JobSnapshot<K: JobKind> {
    pub status: JobStatus,
    pub progress: Option<ProgressEvent>,
    pub result: Option<K::Outcome>,
    pub error_message: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
}
