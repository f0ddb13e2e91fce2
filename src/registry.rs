use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{Config, PLAN_CONCURRENCY};
use crate::contracts::{JobKind, MaterialProcessing, PlanGeneration};
use crate::error::{AppError, AppResult};
use crate::queue::{BrokerConfig, JobBroker, Queue, RedisBroker};
use crate::worker::{spawn_worker, JobHandler, WorkerHandle, WorkerOptions};

/// Composition-root handle owning the broker, the two queues and every
/// registered worker.
///
/// Constructed once by the process entry point (web server or worker
/// process) and passed down explicitly; there is no global instance.
pub struct JobRegistry {
    broker: Arc<dyn JobBroker>,
    materials: Queue<MaterialProcessing>,
    plans: Queue<PlanGeneration>,
    material_concurrency: usize,
    workers: Mutex<Vec<WorkerHandle>>,
    closed: AtomicBool,
}

impl JobRegistry {
    /// Connect to the broker named by the configuration.
    ///
    /// Configuration faults (missing or unusable connection string,
    /// unreachable broker) fail here, at startup; nothing is retried.
    pub async fn connect(config: &Config) -> AppResult<Self> {
        let broker_config = BrokerConfig::parse(&config.redis_url)?;
        let conn = broker_config.connect().await?;
        let broker: Arc<dyn JobBroker> = Arc::new(RedisBroker::new(conn));

        Ok(Self::assemble(broker, config.material_concurrency))
    }

    /// Build a registry over an existing broker (tests use the in-memory one)
    pub fn with_broker(broker: Arc<dyn JobBroker>, material_concurrency: usize) -> Self {
        Self::assemble(broker, material_concurrency)
    }

    fn assemble(broker: Arc<dyn JobBroker>, material_concurrency: usize) -> Self {
        Self {
            materials: Queue::new(broker.clone()),
            plans: Queue::new(broker.clone()),
            broker,
            material_concurrency: material_concurrency.max(1),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Typed port for submitting and polling material-processing jobs
    pub fn materials(&self) -> Queue<MaterialProcessing> {
        self.materials.clone()
    }

    /// Typed port for submitting and polling plan-generation jobs
    pub fn plans(&self) -> Queue<PlanGeneration> {
        self.plans.clone()
    }

    /// Start a material-processing worker with the configured concurrency.
    pub async fn start_material_worker<H>(&self, handler: Arc<H>) -> AppResult<()>
    where
        H: JobHandler<MaterialProcessing>,
    {
        let options = WorkerOptions::with_concurrency(self.material_concurrency);
        self.start_worker::<MaterialProcessing, H>(handler, options).await
    }

    /// Start a plan-generation worker. Concurrency is pinned at 1: each job
    /// issues an expensive generative-model call.
    pub async fn start_plan_worker<H>(&self, handler: Arc<H>) -> AppResult<()>
    where
        H: JobHandler<PlanGeneration>,
    {
        let options = WorkerOptions::with_concurrency(PLAN_CONCURRENCY);
        self.start_worker::<PlanGeneration, H>(handler, options).await
    }

    async fn start_worker<K, H>(&self, handler: Arc<H>, options: WorkerOptions) -> AppResult<()>
    where
        K: JobKind,
        H: JobHandler<K>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Queue("registry is shut down".to_string()));
        }

        let handle = spawn_worker::<K, H>(self.broker.clone(), handler, options);
        self.workers.lock().await.push(handle);

        Ok(())
    }

    /// Graceful shutdown: workers first (stop claiming, drain in-flight
    /// jobs), then the broker. Closing the broker first would strand
    /// in-flight jobs with no way to report their outcome. Idempotent.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let workers: Vec<WorkerHandle> = {
            let mut guard = self.workers.lock().await;
            guard.drain(..).collect()
        };

        for worker in workers {
            tracing::info!(queue = worker.queue(), "Stopping worker");
            worker.shutdown().await;
        }

        self.broker.close().await?;
        tracing::info!("Job registry shut down");

        Ok(())
    }
}
