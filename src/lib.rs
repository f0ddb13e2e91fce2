// Job orchestration layer for Mindloom
// Linked by the web server (submission + status polling) and by the worker
// processes (handler execution); neither surface lives in this crate.

pub mod config;
pub mod contracts;
pub mod error;
pub mod queue;
pub mod registry;
pub mod session;
pub mod worker;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use registry::JobRegistry;
