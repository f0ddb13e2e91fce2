use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// One execution attempt of a learning session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRun {
    pub run_id: Uuid,
    pub session_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl SessionRun {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            session_id,
            started_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Result of a start request; the transport layer maps `Created` to 201 and
/// `Existing` to 200.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Created(SessionRun),
    Existing(SessionRun),
}

impl StartOutcome {
    pub fn run(&self) -> &SessionRun {
        match self {
            Self::Created(run) | Self::Existing(run) => run,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Relational persistence of runs, owned by the business layer.
#[async_trait]
pub trait SessionRunRepository: Send + Sync {
    async fn insert(&self, run: &SessionRun) -> AppResult<()>;
}

/// Idempotency-key reservations, scoped per session.
#[async_trait]
pub trait RunDedupStore: Send + Sync {
    /// Atomically reserve `key` for the session. Returns the run already
    /// holding the reservation when the key is taken.
    async fn reserve(&self, session_id: Uuid, key: &str, run: &SessionRun) -> AppResult<Option<SessionRun>>;

    async fn lookup(&self, session_id: Uuid, key: &str) -> AppResult<Option<SessionRun>>;

    async fn release(&self, session_id: Uuid, key: &str) -> AppResult<()>;
}

/// Idempotent session-run start.
///
/// With an idempotency key, retried start requests return the original run
/// instead of creating duplicates; without a key every call creates a fresh
/// run and duplicate starts are the caller's responsibility.
pub struct SessionRunService<R, D> {
    repo: Arc<R>,
    dedup: Arc<D>,
}

impl<R, D> SessionRunService<R, D>
where
    R: SessionRunRepository,
    D: RunDedupStore,
{
    pub fn new(repo: Arc<R>, dedup: Arc<D>) -> Self {
        Self { repo, dedup }
    }

    pub async fn start_run(
        &self,
        session_id: Uuid,
        idempotency_key: Option<&str>,
    ) -> AppResult<StartOutcome> {
        let Some(key) = idempotency_key else {
            let run = SessionRun::new(session_id);
            self.repo.insert(&run).await?;
            tracing::info!(run_id = %run.run_id, session_id = %session_id, "Session run started");
            return Ok(StartOutcome::Created(run));
        };

        if let Some(existing) = self.dedup.lookup(session_id, key).await? {
            tracing::info!(run_id = %existing.run_id, session_id = %session_id, key, "Start request matched prior run");
            return Ok(StartOutcome::Existing(existing));
        }

        // Reserve the key before touching the store so a concurrent retry
        // cannot create a second run while this one is still in flight.
        let run = SessionRun::new(session_id);
        if let Some(winner) = self.dedup.reserve(session_id, key, &run).await? {
            tracing::info!(run_id = %winner.run_id, session_id = %session_id, key, "Lost start race, returning winner");
            return Ok(StartOutcome::Existing(winner));
        }

        if let Err(e) = self.repo.insert(&run).await {
            // The reservation must not outlive a failed start
            if let Err(release_err) = self.dedup.release(session_id, key).await {
                tracing::warn!(session_id = %session_id, key, error = %release_err, "Failed to release idempotency key");
            }
            return Err(e);
        }

        tracing::info!(run_id = %run.run_id, session_id = %session_id, key, "Session run started");
        Ok(StartOutcome::Created(run))
    }
}

/// Redis keys structure:
/// - mindloom:runs:dedup:{session_id}:{key} - String for the reserved run (JSON)
const RUN_DEDUP_PREFIX: &str = "mindloom:runs:dedup:";

/// Reservations expire after a day; a retry that stale is a new start.
const RUN_DEDUP_TTL_SECS: u64 = 86_400;

/// Redis-backed idempotency-key store
#[derive(Clone)]
pub struct RedisRunDedupStore {
    conn: RedisConnectionManager,
}

impl RedisRunDedupStore {
    pub fn new(conn: RedisConnectionManager) -> Self {
        Self { conn }
    }

    fn key(session_id: Uuid, key: &str) -> String {
        format!("{}{}:{}", RUN_DEDUP_PREFIX, session_id, key)
    }
}

#[async_trait]
impl RunDedupStore for RedisRunDedupStore {
    async fn reserve(&self, session_id: Uuid, key: &str, run: &SessionRun) -> AppResult<Option<SessionRun>> {
        let mut conn = self.conn.clone();
        let run_json = serde_json::to_string(run)?;

        let options = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .get(true)
            .with_expiration(redis::SetExpiry::EX(RUN_DEDUP_TTL_SECS));

        let prior: Option<String> = conn
            .set_options(Self::key(session_id, key), run_json, options)
            .await?;

        match prior {
            None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        }
    }

    async fn lookup(&self, session_id: Uuid, key: &str) -> AppResult<Option<SessionRun>> {
        let mut conn = self.conn.clone();

        let run_json: Option<String> = conn.get(Self::key(session_id, key)).await?;

        match run_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn release(&self, session_id: Uuid, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::key(session_id, key)).await?;
        Ok(())
    }
}

/// In-memory run store for unit testing
#[derive(Clone, Default)]
pub struct InMemoryRunRepository {
    runs: Arc<Mutex<Vec<SessionRun>>>,
    fail_inserts: Arc<std::sync::atomic::AtomicBool>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<SessionRun> {
        self.runs.lock().await.clone()
    }

    /// Make subsequent inserts fail (for exercising the release path)
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionRunRepository for InMemoryRunRepository {
    async fn insert(&self, run: &SessionRun) -> AppResult<()> {
        if self.fail_inserts.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(AppError::Internal("insert failed".to_string()));
        }
        self.runs.lock().await.push(run.clone());
        Ok(())
    }
}

/// In-memory idempotency-key store for unit testing
#[derive(Clone, Default)]
pub struct InMemoryRunDedupStore {
    reservations: Arc<Mutex<HashMap<(Uuid, String), SessionRun>>>,
}

impl InMemoryRunDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunDedupStore for InMemoryRunDedupStore {
    async fn reserve(&self, session_id: Uuid, key: &str, run: &SessionRun) -> AppResult<Option<SessionRun>> {
        let mut reservations = self.reservations.lock().await;
        let entry = (session_id, key.to_string());
        if let Some(existing) = reservations.get(&entry) {
            return Ok(Some(existing.clone()));
        }
        reservations.insert(entry, run.clone());
        Ok(None)
    }

    async fn lookup(&self, session_id: Uuid, key: &str) -> AppResult<Option<SessionRun>> {
        let reservations = self.reservations.lock().await;
        Ok(reservations.get(&(session_id, key.to_string())).cloned())
    }

    async fn release(&self, session_id: Uuid, key: &str) -> AppResult<()> {
        let mut reservations = self.reservations.lock().await;
        reservations.remove(&(session_id, key.to_string()));
        Ok(())
    }
}
