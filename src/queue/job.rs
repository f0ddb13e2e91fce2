use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Job status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue, including waiting out a retry delay
    Waiting,
    /// Claimed by a worker and executing
    Active,
    /// Completed successfully, result attached
    Completed,
    /// Terminally failed (attempts exhausted)
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Retry delay strategy: exponential, `base * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
        }
    }

    /// Delay applied after the `attempt`-th failed execution (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// How long finished jobs stay readable for inspection and status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many completed jobs per queue
    pub completed_keep_count: u32,
    /// Keep completed jobs at most this long (seconds)
    pub completed_keep_secs: u64,
    /// Keep terminally failed jobs this long (seconds)
    pub failed_keep_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_keep_count: 100,
            completed_keep_secs: 3600,
            failed_keep_secs: 86_400,
        }
    }
}

/// Submission options, resolved per job kind at enqueue time.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Max executions of the job (first attempt included)
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
    /// De-duplication token: while a prior job submitted with the same token
    /// is still retained, resubmission returns the original job id.
    pub dedup_id: Option<String>,
}

/// Progress snapshot attached to an in-flight job, visible to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: String,
    /// 0-100
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A unit of asynchronous work submitted to a queue.
///
/// The broker owns durability of this record; a worker owns the in-progress
/// mutation of `progress` and the terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, assigned at submission
    pub id: Uuid,

    /// Queue (job kind) this job belongs to
    pub queue: String,

    /// Kind-specific payload, immutable after submission
    pub payload: JsonValue,

    /// Current status
    pub status: JobStatus,

    /// Executions started so far (incremented when a worker claims the job)
    pub attempts_made: u32,
    pub max_attempts: u32,

    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
    pub dedup_id: Option<String>,

    /// Last reported progress event, none until the first report
    pub progress: Option<ProgressEvent>,

    /// Kind-specific result, set on completion
    pub result: Option<JsonValue>,

    /// Error from the most recent failed execution
    pub error_message: Option<String>,

    /// Timestamps
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: JsonValue, options: &SubmitOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff,
            retention: options.retention,
            dedup_id: options.dedup_id.clone(),
            progress: None,
            result: None,
            error_message: None,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether another execution attempt remains after a failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SubmitOptions {
        SubmitOptions {
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
            retention: RetentionPolicy::default(),
            dedup_id: None,
        }
    }

    #[test]
    fn test_job_status_is_terminal() {
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_create_job() {
        let job = Job::new("material-processing", serde_json::json!({"upload": 1}), &options());

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.progress.is_none());
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let mut opts = options();
        opts.attempts = 0;
        let job = Job::new("plan-generation", JsonValue::Null, &opts);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = BackoffPolicy::exponential(Duration::from_millis(500));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_job_serialization() {
        let mut job = Job::new("material-processing", serde_json::json!({"title": "notes"}), &options());
        job.progress = Some(ProgressEvent {
            step: "PARSING".to_string(),
            progress: 40,
            message: Some("12 pages".to_string()),
        });

        let json = serde_json::to_string(&job).unwrap();
        let deserialized: Job = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.id, job.id);
        assert_eq!(deserialized.queue, "material-processing");
        assert_eq!(deserialized.progress, job.progress);
    }

    #[test]
    fn test_progress_event_omits_empty_message() {
        let event = ProgressEvent {
            step: "VALIDATING".to_string(),
            progress: 0,
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("message"));
    }
}
