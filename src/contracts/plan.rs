use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{JobKind, ProgressStep};
use crate::queue::job::{BackoffPolicy, RetentionPolicy, SubmitOptions};

/// Plan generation: turn a set of materials into a structured, multi-module
/// learning plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanGeneration;

/// Input for one plan-generation job. Immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanJobPayload {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub public_id: String,
    pub material_ids: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub target_due_date: Option<OffsetDateTime>,
    pub special_requirements: Option<String>,
    pub icon: String,
    pub color: String,
}

/// Final state of the generated plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Active,
    Failed,
}

/// Result attached to a completed plan-generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanJobOutcome {
    pub plan_id: Uuid,
    pub public_id: String,
    pub title: String,
    pub status: PlanStatus,
    pub module_count: Option<u32>,
    pub session_count: Option<u32>,
}

/// Progress steps for plan generation, in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStep {
    Validating,
    Generating,
    CreatingModules,
    CreatingSessions,
    Finalizing,
    Completed,
}

impl ProgressStep for PlanStep {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "VALIDATING",
            Self::Generating => "GENERATING",
            Self::CreatingModules => "CREATING_MODULES",
            Self::CreatingSessions => "CREATING_SESSIONS",
            Self::Finalizing => "FINALIZING",
            Self::Completed => "COMPLETED",
        }
    }

    fn position(&self) -> u8 {
        match self {
            Self::Validating => 0,
            Self::Generating => 1,
            Self::CreatingModules => 2,
            Self::CreatingSessions => 3,
            Self::Finalizing => 4,
            Self::Completed => 5,
        }
    }
}

impl JobKind for PlanGeneration {
    const QUEUE_NAME: &'static str = "plan-generation";

    type Payload = PlanJobPayload;
    type Outcome = PlanJobOutcome;
    type Step = PlanStep;

    // A retry re-runs the full generative-model call, so the budget is
    // smaller and the backoff longer than for material processing.
    fn default_options() -> SubmitOptions {
        SubmitOptions {
            attempts: 2,
            backoff: BackoffPolicy::exponential(Duration::from_secs(5)),
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
        assert_eq!(PlanStep::CreatingModules.as_str(), "CREATING_MODULES");
        assert_eq!(
            serde_json::to_string(&PlanStep::CreatingSessions).unwrap(),
            "\"CREATING_SESSIONS\""
        );
    }

    #[test]
    fn test_default_options() {
        let options = PlanGeneration::default_options();
        assert_eq!(options.attempts, 2);
        assert_eq!(options.backoff.delay_for(1), Duration::from_secs(5));
    }

    #[test]
    fn test_payload_serialization() {
        let payload = PlanJobPayload {
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            public_id: "plan_9xk2".to_string(),
            material_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            target_due_date: None,
            special_requirements: Some("focus on proofs".to_string()),
            icon: "book".to_string(),
            color: "#4f46e5".to_string(),
        };

        let json = serde_json::to_string(&payload).unwrap();
        let deserialized: PlanJobPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.plan_id, payload.plan_id);
        assert_eq!(deserialized.material_ids.len(), 2);
        assert!(deserialized.target_due_date.is_none());
    }
}
