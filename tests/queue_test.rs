use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use mindloom_jobs::contracts::{
    JobKind, MaterialJobOutcome, MaterialJobPayload, MaterialProcessing, MaterialStatus,
    PlanGeneration,
};
use mindloom_jobs::queue::{
    BackoffPolicy, InMemoryBroker, JobBroker, JobStatus, ProgressEvent, Queue, RetentionPolicy,
    SubmitOptions,
};
use mindloom_jobs::JobRegistry;

fn payload(title: &str) -> MaterialJobPayload {
    MaterialJobPayload {
        user_id: Uuid::new_v4(),
        upload_id: Uuid::new_v4(),
        title: title.to_string(),
        etag: None,
    }
}

fn options_with_dedup(token: &str) -> SubmitOptions {
    SubmitOptions {
        dedup_id: Some(token.to_string()),
        ..MaterialProcessing::default_options()
    }
}

fn setup() -> (Arc<dyn JobBroker>, Queue<MaterialProcessing>) {
    let broker: Arc<dyn JobBroker> = Arc::new(InMemoryBroker::new());
    let queue = Queue::new(broker.clone());
    (broker, queue)
}

#[tokio::test]
async fn test_snapshot_has_no_result_until_completed() {
    let (broker, queue) = setup();

    let job_id = queue.submit(payload("Linear Algebra")).await.unwrap();

    let snapshot = queue.snapshot(job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobStatus::Waiting);
    assert!(snapshot.result.is_none());
    assert!(snapshot.error_message.is_none());
    assert_eq!(snapshot.attempts_made, 0);
    assert_eq!(snapshot.max_attempts, 3);

    // Drive the job to completion through the broker directly
    let claimed = broker
        .claim(MaterialProcessing::QUEUE_NAME, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job_id);

    let snapshot = queue.snapshot(job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobStatus::Active);
    assert!(snapshot.result.is_none());

    let outcome = MaterialJobOutcome {
        material_id: Uuid::new_v4(),
        title: "Linear Algebra".to_string(),
        summary: None,
        processing_status: MaterialStatus::Ready,
    };
    broker
        .complete(job_id, serde_json::to_value(&outcome).unwrap())
        .await
        .unwrap();

    let snapshot = queue.snapshot(job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobStatus::Completed);
    let result = snapshot.result.unwrap();
    assert_eq!(result.material_id, outcome.material_id);
    assert_eq!(result.processing_status, MaterialStatus::Ready);
}

#[tokio::test]
async fn test_snapshot_unknown_id_is_none() {
    let (_broker, queue) = setup();
    assert!(queue.snapshot(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshot_rejects_job_from_other_queue() {
    let (broker, materials) = setup();
    let plans: Queue<PlanGeneration> = Queue::new(broker);

    let job_id = materials.submit(payload("World History")).await.unwrap();

    // The id exists, but it belongs to the material queue
    assert!(plans.snapshot(job_id).await.unwrap().is_none());
    assert!(materials.snapshot(job_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_dedup_token_returns_original_id() {
    let (_broker, queue) = setup();

    let first = queue
        .submit_with(payload("Chemistry"), options_with_dedup("upload:etag-1"))
        .await
        .unwrap();
    let second = queue
        .submit_with(payload("Chemistry"), options_with_dedup("upload:etag-1"))
        .await
        .unwrap();
    let other = queue
        .submit_with(payload("Chemistry"), options_with_dedup("upload:etag-2"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
    assert_eq!(queue.depth().await.unwrap(), 2);
}

#[tokio::test]
async fn test_progress_visible_while_active() {
    let (broker, queue) = setup();

    let job_id = queue.submit(payload("Botany")).await.unwrap();
    broker
        .claim(MaterialProcessing::QUEUE_NAME, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();

    broker
        .report_progress(
            job_id,
            ProgressEvent {
                step: "ANALYZING".to_string(),
                progress: 70,
                message: None,
            },
        )
        .await
        .unwrap();

    let snapshot = queue.snapshot(job_id).await.unwrap().unwrap();
    let progress = snapshot.progress.unwrap();
    assert_eq!(progress.step, "ANALYZING");
    assert_eq!(progress.progress, 70);
}

#[tokio::test]
async fn test_failed_execution_requeues_after_backoff() {
    let (broker, queue) = setup();

    let options = SubmitOptions {
        attempts: 2,
        backoff: BackoffPolicy::exponential(Duration::from_millis(30)),
        retention: RetentionPolicy::default(),
        dedup_id: None,
    };
    let job_id = queue.submit_with(payload("Geometry"), options).await.unwrap();

    broker
        .claim(MaterialProcessing::QUEUE_NAME, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    broker.fail(job_id, "parse error".to_string()).await.unwrap();

    // Still waiting out the retry delay: not claimable yet
    let early = broker
        .claim(MaterialProcessing::QUEUE_NAME, Duration::from_millis(5))
        .await
        .unwrap();
    assert!(early.is_none());

    let snapshot = queue.snapshot(job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobStatus::Waiting);
    assert_eq!(snapshot.error_message.as_deref(), Some("parse error"));

    tokio::time::sleep(Duration::from_millis(60)).await;

    let retried = broker
        .claim(MaterialProcessing::QUEUE_NAME, Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.id, job_id);
    assert_eq!(retried.attempts_made, 2);
}

#[tokio::test]
async fn test_registry_queues_share_one_broker() {
    let broker: Arc<dyn JobBroker> = Arc::new(InMemoryBroker::new());
    let registry = JobRegistry::with_broker(broker, 2);

    let job_id = registry.materials().submit(payload("Physics")).await.unwrap();

    // A second clone of the port observes the same job
    let snapshot = registry.materials().snapshot(job_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, JobStatus::Waiting);
    assert_eq!(registry.materials().depth().await.unwrap(), 1);
    assert_eq!(registry.plans().depth().await.unwrap(), 0);

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_completed_retention_keeps_newest() {
    let (broker, queue) = setup();

    let options = SubmitOptions {
        attempts: 1,
        backoff: BackoffPolicy::exponential(Duration::from_millis(1)),
        retention: RetentionPolicy {
            completed_keep_count: 2,
            completed_keep_secs: 3600,
            failed_keep_secs: 86_400,
        },
        dedup_id: None,
    };

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = queue
            .submit_with(payload(&format!("Deck {}", i)), options.clone())
            .await
            .unwrap();
        broker
            .claim(MaterialProcessing::QUEUE_NAME, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let outcome = MaterialJobOutcome {
            material_id: Uuid::new_v4(),
            title: format!("Deck {}", i),
            summary: None,
            processing_status: MaterialStatus::Ready,
        };
        broker
            .complete(id, serde_json::to_value(&outcome).unwrap())
            .await
            .unwrap();
        ids.push(id);
    }

    // Only the two most recently completed jobs remain readable
    assert!(queue.snapshot(ids[0]).await.unwrap().is_none());
    assert!(queue.snapshot(ids[1]).await.unwrap().is_none());
    assert!(queue.snapshot(ids[2]).await.unwrap().is_some());
    assert!(queue.snapshot(ids[3]).await.unwrap().is_some());
}
