use std::env;

/// Default parallelism for the material-processing worker.
pub const DEFAULT_MATERIAL_CONCURRENCY: usize = 2;

/// Plan generation runs one job at a time per process: each job issues an
/// expensive generative-model call and parallel spend is deliberately avoided.
/// Not configurable.
pub const PLAN_CONCURRENCY: usize = 1;

#[derive(Debug, Clone)]
pub struct Config {
    /// Broker connection string (redis:// or rediss://)
    pub redis_url: String,

    /// Max simultaneous material-processing jobs per worker process
    pub material_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A missing or unparsable `REDIS_URL` is a fatal startup fault, never a
    /// retryable runtime error.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if exists

        let material_concurrency = match env::var("MATERIAL_WORKER_CONCURRENCY") {
            Ok(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or(ConfigError::Invalid("MATERIAL_WORKER_CONCURRENCY"))?,
            Err(_) => DEFAULT_MATERIAL_CONCURRENCY,
        };

        Ok(Self {
            redis_url: env::var("REDIS_URL").map_err(|_| ConfigError::Missing("REDIS_URL"))?,
            material_concurrency,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid environment variable: {0}")]
    Invalid(&'static str),
}
