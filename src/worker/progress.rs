use std::marker::PhantomData;
use std::sync::Arc;

use uuid::Uuid;

use crate::contracts::{JobKind, ProgressStep};
use crate::error::{AppError, AppResult};
use crate::queue::{JobBroker, ProgressEvent};

/// Progress callback handed to a job handler.
///
/// Each report is attached to the job record before the call returns, so a
/// crash immediately after a report cannot lose it, and pollers observe
/// events in the order the handler issued them.
pub struct ProgressReporter<K: JobKind> {
    broker: Arc<dyn JobBroker>,
    job_id: Uuid,
    _kind: PhantomData<fn() -> K>,
}

impl<K: JobKind> ProgressReporter<K> {
    pub fn new(broker: Arc<dyn JobBroker>, job_id: Uuid) -> Self {
        Self {
            broker,
            job_id,
            _kind: PhantomData,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Deliver a progress snapshot to the broker.
    pub async fn report(&self, step: K::Step, percent: u8, message: Option<&str>) -> AppResult<()> {
        if percent > 100 {
            return Err(AppError::Validation(format!(
                "progress must be 0-100, got {}",
                percent
            )));
        }

        let event = ProgressEvent {
            step: step.as_str().to_string(),
            progress: percent,
            message: message.map(String::from),
        };

        self.broker.report_progress(self.job_id, event).await
    }

    /// Like `report`, but a delivery failure is logged instead of returned.
    /// Losing one snapshot is not fatal to the job.
    pub async fn report_or_log(&self, step: K::Step, percent: u8, message: Option<&str>) {
        if let Err(e) = self.report(step, percent, message).await {
            tracing::warn!(
                job_id = %self.job_id,
                step = step.as_str(),
                error = %e,
                "Failed to report job progress"
            );
        }
    }
}
