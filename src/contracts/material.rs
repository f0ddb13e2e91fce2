use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobKind, ProgressStep};
use crate::queue::job::{BackoffPolicy, RetentionPolicy, SubmitOptions};

/// Material processing: turn an uploaded document into an analyzed,
/// searchable material.
#[derive(Debug, Clone, Copy)]
pub struct MaterialProcessing;

/// Input for one material-processing job. Immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialJobPayload {
    pub user_id: Uuid,
    pub upload_id: Uuid,
    pub title: String,
    pub etag: Option<String>,
}

/// Final state of the produced material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaterialStatus {
    Ready,
    Failed,
}

/// Result attached to a completed material-processing job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialJobOutcome {
    pub material_id: Uuid,
    pub title: String,
    pub summary: Option<String>,
    pub processing_status: MaterialStatus,
}

/// Progress steps for material processing, in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaterialStep {
    Validating,
    Parsing,
    Analyzing,
    Indexing,
    Finalizing,
    Completed,
}

impl ProgressStep for MaterialStep {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "VALIDATING",
            Self::Parsing => "PARSING",
            Self::Analyzing => "ANALYZING",
            Self::Indexing => "INDEXING",
            Self::Finalizing => "FINALIZING",
            Self::Completed => "COMPLETED",
        }
    }

    fn position(&self) -> u8 {
        match self {
            Self::Validating => 0,
            Self::Parsing => 1,
            Self::Analyzing => 2,
            Self::Indexing => 3,
            Self::Finalizing => 4,
            Self::Completed => 5,
        }
    }
}

impl JobKind for MaterialProcessing {
    const QUEUE_NAME: &'static str = "material-processing";

    type Payload = MaterialJobPayload;
    type Outcome = MaterialJobOutcome;
    type Step = MaterialStep;

    fn default_options() -> SubmitOptions {
        SubmitOptions {
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
            retention: RetentionPolicy::default(),
            dedup_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_wire_form() {
        assert_eq!(MaterialStep::Validating.as_str(), "VALIDATING");
        assert_eq!(MaterialStep::Indexing.as_str(), "INDEXING");
        assert_eq!(
            serde_json::to_string(&MaterialStep::Analyzing).unwrap(),
            "\"ANALYZING\""
        );
    }

    #[test]
    fn test_step_ordering() {
        let steps = [
            MaterialStep::Validating,
            MaterialStep::Parsing,
            MaterialStep::Analyzing,
            MaterialStep::Indexing,
            MaterialStep::Finalizing,
            MaterialStep::Completed,
        ];
        for pair in steps.windows(2) {
            assert!(pair[0].position() < pair[1].position());
        }
    }

    #[test]
    fn test_default_options() {
        let options = MaterialProcessing::default_options();
        assert_eq!(options.attempts, 3);
        assert_eq!(options.backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(options.retention.completed_keep_count, 100);
    }

    #[test]
    fn test_payload_serialization() {
        let payload = MaterialJobPayload {
            user_id: Uuid::new_v4(),
            upload_id: Uuid::new_v4(),
            title: "Linear Algebra Notes".to_string(),
            etag: None,
        };

        let json = serde_json::to_string(&payload).unwrap();
        let deserialized: MaterialJobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.upload_id, payload.upload_id);
        assert!(deserialized.etag.is_none());
    }
}
