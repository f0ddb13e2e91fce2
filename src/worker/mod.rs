pub mod progress;
pub mod runtime;

pub use progress::ProgressReporter;
pub use runtime::{spawn_worker, JobHandler, WorkerHandle, WorkerOptions};
