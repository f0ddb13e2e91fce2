use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::contracts::JobKind;
use crate::error::AppResult;
use crate::queue::{Job, JobBroker};
use crate::worker::ProgressReporter;

/// Handler for one job kind, injected by the business layer.
///
/// The orchestration layer never imports handler logic; it only translates
/// the returned `Result` into the broker's completion primitives.
#[async_trait]
pub trait JobHandler<K: JobKind>: Send + Sync + 'static {
    async fn run(&self, payload: K::Payload, progress: &ProgressReporter<K>) -> AppResult<K::Outcome>;
}

/// Worker tuning knobs
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Max handler invocations in flight at once
    pub concurrency: usize,
    /// How long one claim call blocks; bounds how quickly the worker
    /// notices a shutdown request while idle
    pub claim_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            claim_timeout: Duration::from_millis(500),
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    queue: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        self.queue
    }

    /// Stop claiming new jobs, then wait for every in-flight handler to
    /// reach a terminal outcome before returning.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(queue = self.queue, error = ?e, "Worker task panicked during shutdown");
        }
    }
}

/// Start a worker that claims jobs for `K`'s queue and feeds them to
/// `handler`, up to `options.concurrency` at a time.
pub fn spawn_worker<K, H>(
    broker: Arc<dyn JobBroker>,
    handler: Arc<H>,
    options: WorkerOptions,
) -> WorkerHandle
where
    K: JobKind,
    H: JobHandler<K>,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(run_loop::<K, H>(broker, handler, options, shutdown_rx));

    WorkerHandle {
        queue: K::QUEUE_NAME,
        shutdown_tx,
        join,
    }
}

async fn run_loop<K, H>(
    broker: Arc<dyn JobBroker>,
    handler: Arc<H>,
    options: WorkerOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    K: JobKind,
    H: JobHandler<K>,
{
    let concurrency = options.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<()> = JoinSet::new();

    tracing::info!(queue = K::QUEUE_NAME, concurrency, "Worker started");

    loop {
        // has_changed errs once the sender is gone, i.e. the handle was
        // dropped without an explicit shutdown call
        if *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err() {
            break;
        }

        // Reap finished executions so the join set does not grow unbounded
        while tasks.try_join_next().is_some() {}

        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            changed = shutdown_rx.changed() => {
                // A dropped handle counts as a shutdown request; looping on
                // the closed channel would spin while permits are held.
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        // The claim itself is not raced against shutdown: cancelling it
        // mid-flight could drop a job the broker already handed over. Its
        // timeout bounds how long shutdown waits instead.
        match broker.claim(K::QUEUE_NAME, options.claim_timeout).await {
            Ok(Some(job)) => {
                let broker = broker.clone();
                let handler = handler.clone();
                tasks.spawn(async move {
                    execute::<K, H>(broker, handler, job).await;
                    drop(permit);
                });
            }
            Ok(None) => drop(permit),
            Err(e) => {
                drop(permit);
                tracing::error!(queue = K::QUEUE_NAME, error = %e, "Error claiming job");
                // Brief sleep on error to prevent a tight loop
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    // Drain in-flight jobs; each reaches completed or failed before the
    // worker reports itself stopped.
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(queue = K::QUEUE_NAME, error = ?e, "Job task panicked");
        }
    }

    tracing::info!(queue = K::QUEUE_NAME, "Worker stopped");
}

/// Run one claimed job to a terminal outcome. Every exit path marks the job
/// completed or failed; a handler fault can never leave it active.
async fn execute<K, H>(broker: Arc<dyn JobBroker>, handler: Arc<H>, job: Job)
where
    K: JobKind,
    H: JobHandler<K>,
{
    let job_id = job.id;
    tracing::info!(job_id = %job_id, queue = %job.queue, attempt = job.attempts_made, "Processing job");

    let payload: K::Payload = match serde_json::from_value(job.payload.clone()) {
        Ok(payload) => payload,
        Err(e) => {
            // A malformed payload can never succeed, but it still takes the
            // normal failure path and consumes an attempt.
            fail_job(&broker, job_id, format!("Invalid payload: {}", e)).await;
            return;
        }
    };

    let progress = ProgressReporter::<K>::new(broker.clone(), job_id);
    let outcome = AssertUnwindSafe(handler.run(payload, &progress))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(result)) => match serde_json::to_value(&result) {
            Ok(value) => {
                if let Err(e) = broker.complete(job_id, value).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as complete");
                }
            }
            Err(e) => {
                fail_job(&broker, job_id, format!("Result serialization error: {}", e)).await;
            }
        },
        Ok(Err(e)) => {
            fail_job(&broker, job_id, e.to_string()).await;
        }
        Err(panic) => {
            fail_job(&broker, job_id, format!("Handler panicked: {}", panic_message(panic))).await;
        }
    }
}

async fn fail_job(broker: &Arc<dyn JobBroker>, job_id: Uuid, error: String) {
    if let Err(e) = broker.fail(job_id, error).await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_options_default() {
        let options = WorkerOptions::default();
        assert_eq!(options.concurrency, 1);
        assert_eq!(options.claim_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_with_concurrency() {
        let options = WorkerOptions::with_concurrency(4);
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.claim_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static str")), "static str");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic");
    }
}
