//! Bounded worker pool draining the analysis queue.
//!
//! A single dispatcher loop polls the queue every `poll_interval` and
//! claims as many jobs as there are free permits. Each claimed job runs on
//! its own task; the queue is told the outcome so it can apply the retry
//! policy. Distinct jobs run in parallel up to `concurrency`.
//!
//! A job task that panics is reported as a failed attempt. Jobs lost with
//! the whole process stay `active` until the queue's lock expires.

use std::sync::Arc;
use std::time::Duration;

use threatlens_core::queue::RetryDecision;
use threatlens_core::types::AnalysisId;
use threatlens_db::{ClaimedJob, JobQueue};
use threatlens_pipeline::{AnalysisWorker, ProcessOutcome};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    worker: Arc<AnalysisWorker>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        worker: Arc<AnalysisWorker>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            worker,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Run until `cancel` fires, then wait for in-flight jobs to finish.
    ///
    /// Running jobs are never interrupted.
    pub async fn run(&self, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker pool started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(in_flight = tasks.len(), "Worker pool shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.dispatch(&permits, &mut tasks).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Analysis task panicked");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Analysis task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    /// Claim due jobs while permits remain.
    async fn dispatch(&self, permits: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
        loop {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                return;
            };

            let claimed = match self.queue.claim_next().await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim next job");
                    return;
                }
            };

            tracing::info!(
                analysis_id = %claimed.envelope.payload.analysis_id,
                attempt = claimed.attempt,
                "Job claimed",
            );
            tasks.spawn(supervise(
                Arc::clone(&self.queue),
                Arc::clone(&self.worker),
                claimed,
                permit,
            ));
        }
    }
}

/// Run one claimed job on its own task so a panic still reaches the queue.
///
/// The permit is held until the outcome has been recorded.
async fn supervise(
    queue: Arc<dyn JobQueue>,
    worker: Arc<AnalysisWorker>,
    claimed: ClaimedJob,
    _permit: OwnedSemaphorePermit,
) {
    let job_id = claimed.envelope.job_id;
    let analysis_id = claimed.envelope.payload.analysis_id;
    let attempt = claimed.attempt;

    let run = tokio::spawn(execute(Arc::clone(&queue), Arc::clone(&worker), claimed));
    let Err(join_err) = run.await else {
        return;
    };

    let message = format!("Analysis task panicked: {join_err}");
    tracing::error!(%analysis_id, error = %join_err, "Analysis task panicked");
    if let Err(e) = worker.record_failure(analysis_id, &message).await {
        tracing::error!(%analysis_id, error = %e, "Failed to record analysis failure");
    }
    report_failure(queue.as_ref(), job_id, analysis_id, attempt, &message).await;
}

/// Process one claimed job and report the outcome to the queue.
async fn execute(queue: Arc<dyn JobQueue>, worker: Arc<AnalysisWorker>, claimed: ClaimedJob) {
    let job_id = claimed.envelope.job_id;
    let analysis_id = claimed.envelope.payload.analysis_id;

    match worker.process(analysis_id).await {
        Ok(outcome) => {
            if outcome == ProcessOutcome::AlreadyCompleted {
                tracing::info!(%analysis_id, "Duplicate delivery of completed job");
            }
            if let Err(e) = queue.complete(job_id).await {
                tracing::error!(%analysis_id, error = %e, "Failed to mark job completed");
            }
        }
        Err(err) => {
            report_failure(queue.as_ref(), job_id, analysis_id, claimed.attempt, &err.to_string())
                .await;
        }
    }
}

async fn report_failure(
    queue: &dyn JobQueue,
    job_id: AnalysisId,
    analysis_id: AnalysisId,
    attempts: u32,
    error: &str,
) {
    match queue.fail(job_id, error).await {
        Ok(RetryDecision::Retry { attempt, delay }) => {
            tracing::warn!(
                %analysis_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Job failed, retry scheduled",
            );
        }
        Ok(RetryDecision::Exhausted) => {
            tracing::error!(%analysis_id, attempts, "Job failed, no attempts left");
        }
        Err(e) => {
            tracing::error!(%analysis_id, error = %e, "Failed to record job failure");
        }
    }
}
