//! Postgres store and queue against a real database.
//!
//! Run with `DATABASE_URL` pointing at a disposable Postgres instance and
//! `cargo test -p threatlens-db -- --ignored`.

use assert_matches::assert_matches;
use sqlx::PgPool;
use threatlens_core::analysis::{AnalysisResult, DetectionMeta, DiagramImage, Locale};
use threatlens_core::progress::{JobStatus, PipelineStage, ProgressSnapshot};
use threatlens_core::queue::{EnqueueOutcome, JobEnvelope, QueueState, RetryDecision};
use threatlens_db::{
    AnalysisStore, JobQueue, NewAnalysis, PgAnalysisStore, PgJobQueue, StoreError,
};

fn new_analysis() -> NewAnalysis {
    NewAnalysis {
        image: DiagramImage::new("arch.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47]),
        language: Locale::PtBr,
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_analysis_lifecycle(pool: PgPool) {
    threatlens_db::health_check(&pool).await.unwrap();
    let store = PgAnalysisStore::new(pool);

    let job = store.create(new_analysis()).await.unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.progress.stage, PipelineStage::Waiting);

    store
        .update_progress(job.id, &ProgressSnapshot::detecting("Detecting"))
        .await
        .unwrap();
    let found = store.find(job.id).await.unwrap().unwrap();
    assert_eq!(found.progress.stage, PipelineStage::DetectingComponents);

    let result = AnalysisResult::new(vec![], vec![], vec![], "aws", vec![], DetectionMeta::default());
    store
        .complete(job.id, &ProgressSnapshot::completed(0), &result)
        .await
        .unwrap();

    assert_eq!(store.result(job.id).await.unwrap(), Some(result.clone()));
    assert_eq!(
        store.find(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    let newer = store.create(new_analysis()).await.unwrap();
    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, newer.id);
    assert_eq!(listed[0].summary, None);
    assert_eq!(listed[1].id, job.id);
    assert_eq!(listed[1].detected_provider.as_deref(), Some("aws"));
    assert_eq!(listed[1].summary, Some(result.summary));

    let image = store.load_image(job.id).await.unwrap().unwrap();
    assert_eq!(image.mime_type, "image/png");

    assert!(store.delete(job.id).await.unwrap());
    assert!(store.find(job.id).await.unwrap().is_none());
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_fail_clears_result_and_records_error(pool: PgPool) {
    let store = PgAnalysisStore::new(pool);
    let job = store.create(new_analysis()).await.unwrap();

    store
        .fail(job.id, &ProgressSnapshot::failed("vision down"), "vision down")
        .await
        .unwrap();

    let found = store.find(job.id).await.unwrap().unwrap();
    assert_eq!(found.status, JobStatus::Failed);
    assert_eq!(found.progress.percentage, 0);
    assert_eq!(found.error.as_deref(), Some("vision down"));
    assert!(store.result(job.id).await.unwrap().is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_missing_analysis_is_not_found(pool: PgPool) {
    let store = PgAnalysisStore::new(pool);
    let err = store.reset_for_processing(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_matches!(err, StoreError::NotFound { .. });
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_queue_deduplicates_and_retries(pool: PgPool) {
    let queue = PgJobQueue::new(pool);
    let id = uuid::Uuid::new_v4();

    assert_eq!(
        queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
        EnqueueOutcome::Enqueued
    );
    assert_eq!(
        queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
        EnqueueOutcome::AlreadyQueued(QueueState::Waiting)
    );

    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.envelope.job_id, id);
    assert_eq!(claimed.attempt, 1);
    assert!(queue.claim_next().await.unwrap().is_none());

    assert_matches!(queue.remove(id).await, Err(StoreError::Conflict(_)));

    assert_matches!(
        queue.fail(id, "boom").await.unwrap(),
        RetryDecision::Retry { attempt: 2, .. }
    );
    assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Delayed));
    // Backoff has not elapsed.
    assert!(queue.claim_next().await.unwrap().is_none());

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.delayed, 1);

    assert!(queue.remove(id).await.unwrap());
    assert_eq!(queue.state(id).await.unwrap(), None);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_completed_entry_is_replaced_on_enqueue(pool: PgPool) {
    let queue = PgJobQueue::new(pool);
    let id = uuid::Uuid::new_v4();

    queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap();
    queue.claim_next().await.unwrap().unwrap();
    queue.complete(id).await.unwrap();
    assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Completed));

    assert_eq!(
        queue.enqueue(JobEnvelope::for_analysis(id)).await.unwrap(),
        EnqueueOutcome::Enqueued
    );
    assert_eq!(queue.claim_next().await.unwrap().unwrap().attempt, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_stalled_active_entry_is_released(pool: PgPool) {
    let queue = PgJobQueue::with_lock_duration(pool, std::time::Duration::from_millis(50));
    let id = uuid::Uuid::new_v4();
    let options = threatlens_core::queue::JobOptions {
        attempts: 2,
        backoff: threatlens_core::queue::Backoff::Exponential { base_ms: 0 },
        ..Default::default()
    };
    queue
        .enqueue(JobEnvelope::with_options(id, options))
        .await
        .unwrap();

    // First claimant disappears without reporting.
    assert_eq!(queue.claim_next().await.unwrap().unwrap().attempt, 1);
    assert!(queue.claim_next().await.unwrap().is_none());

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let reclaimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(reclaimed.envelope.job_id, id);
    assert_eq!(reclaimed.attempt, 2);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(queue.claim_next().await.unwrap().is_none());
    assert_eq!(queue.state(id).await.unwrap(), Some(QueueState::Failed));
}
