pub mod material;
pub mod plan;

pub use material::{MaterialJobOutcome, MaterialJobPayload, MaterialProcessing, MaterialStatus, MaterialStep};
pub use plan::{PlanGeneration, PlanJobOutcome, PlanJobPayload, PlanStatus, PlanStep};

use serde::{de::DeserializeOwned, Serialize};

use crate::queue::job::SubmitOptions;

/// A closed, ordered progress-step enumeration for one job kind.
pub trait ProgressStep: Copy + Send + Sync + 'static {
    /// Wire form of the step (SCREAMING_SNAKE_CASE).
    fn as_str(&self) -> &'static str;

    /// Ordinal of the step within its kind's sequence. Reporting steps in
    /// non-decreasing order is handler discipline; the queue layer does not
    /// reject out-of-order reports.
    fn position(&self) -> u8;
}

/// Compile-time pairing of payload, result and progress shape for one queue.
///
/// Exactly one queue exists per implementor; the queue name is fixed at the
/// contract so producers and workers can never disagree on it.
pub trait JobKind: Send + Sync + 'static {
    const QUEUE_NAME: &'static str;

    type Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Outcome: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Step: ProgressStep;

    /// Submission defaults (attempts, backoff, retention) for this kind.
    fn default_options() -> SubmitOptions;
}
