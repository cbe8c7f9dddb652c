//! Repository for the `analysis_queue` table.
//!
//! Claiming uses `SELECT ... FOR UPDATE SKIP LOCKED` so several worker
//! processes can drain the same table without double-dispatch.

use sqlx::PgPool;
use threatlens_core::queue::QueueState;
use threatlens_core::types::AnalysisId;

use crate::models::queue_entry::QueueEntryRow;

const COLUMNS: &str = "job_id, analysis_id, options, state, attempts_made";

pub struct QueueRepo;

impl QueueRepo {
    /// Insert a `waiting` entry, or replace a finished one with the same id.
    ///
    /// Returns `None` when a live entry already holds the id.
    pub async fn insert_or_replace_finished(
        pool: &PgPool,
        job_id: AnalysisId,
        analysis_id: AnalysisId,
        options: &serde_json::Value,
    ) -> Result<Option<QueueEntryRow>, sqlx::Error> {
        let query = format!(
            "INSERT INTO analysis_queue (job_id, analysis_id, options, state) \
             VALUES ($1, $2, $3, 'waiting') \
             ON CONFLICT (job_id) DO UPDATE \
                 SET analysis_id = EXCLUDED.analysis_id, \
                     options = EXCLUDED.options, \
                     state = 'waiting', \
                     attempts_made = 0, \
                     available_at = NOW(), \
                     last_error = NULL, \
                     enqueued_at = NOW(), \
                     started_at = NULL, \
                     finished_at = NULL \
                 WHERE analysis_queue.state IN ('completed', 'failed') \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueEntryRow>(&query)
            .bind(job_id)
            .bind(analysis_id)
            .bind(options)
            .fetch_optional(pool)
            .await
    }

    pub async fn find(
        pool: &PgPool,
        job_id: AnalysisId,
    ) -> Result<Option<QueueEntryRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM analysis_queue WHERE job_id = $1");
        sqlx::query_as::<_, QueueEntryRow>(&query)
            .bind(job_id)
            .fetch_optional(pool)
            .await
    }

    /// Atomically move the oldest due entry to `active`.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<QueueEntryRow>, sqlx::Error> {
        let query = format!(
            "UPDATE analysis_queue \
             SET state = 'active', attempts_made = attempts_made + 1, started_at = NOW() \
             WHERE job_id = ( \
                 SELECT job_id FROM analysis_queue \
                 WHERE state IN ('waiting', 'delayed') AND available_at <= NOW() \
                 ORDER BY available_at ASC, enqueued_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueEntryRow>(&query)
            .fetch_optional(pool)
            .await
    }

    /// Entries left `active` for longer than `lock_ms`.
    pub async fn find_stalled(
        pool: &PgPool,
        lock_ms: i64,
    ) -> Result<Vec<QueueEntryRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM analysis_queue \
             WHERE state = 'active' \
               AND started_at < NOW() - ($1::BIGINT * INTERVAL '1 millisecond') \
             ORDER BY started_at ASC"
        );
        sqlx::query_as::<_, QueueEntryRow>(&query)
            .bind(lock_ms)
            .fetch_all(pool)
            .await
    }

    /// Move a stalled entry to `delayed`, or to `failed` when `delay_ms` is
    /// `None`.
    ///
    /// Only touches the row if it is still the same stalled attempt, so a
    /// worker that reports in the meantime wins.
    pub async fn release_stalled(
        pool: &PgPool,
        job_id: AnalysisId,
        attempts_made: i32,
        delay_ms: Option<i64>,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analysis_queue \
             SET state = CASE WHEN $3::BIGINT IS NULL THEN 'failed' ELSE 'delayed' END, \
                 available_at = NOW() + (COALESCE($3::BIGINT, 0) * INTERVAL '1 millisecond'), \
                 finished_at = CASE WHEN $3::BIGINT IS NULL THEN NOW() ELSE NULL END, \
                 started_at = NULL, \
                 last_error = $4 \
             WHERE job_id = $1 AND state = 'active' AND attempts_made = $2",
        )
        .bind(job_id)
        .bind(attempts_made)
        .bind(delay_ms)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_completed(pool: &PgPool, job_id: AnalysisId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analysis_queue \
             SET state = 'completed', finished_at = NOW(), last_error = NULL \
             WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Park the entry in `delayed` until `delay_ms` from now.
    pub async fn schedule_retry(
        pool: &PgPool,
        job_id: AnalysisId,
        delay_ms: i64,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analysis_queue \
             SET state = 'delayed', \
                 available_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond'), \
                 last_error = $3 \
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(delay_ms)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(
        pool: &PgPool,
        job_id: AnalysisId,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analysis_queue \
             SET state = 'failed', finished_at = NOW(), last_error = $2 \
             WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete unless the entry is running. Returns whether a row went away.
    pub async fn delete_unless_active(
        pool: &PgPool,
        job_id: AnalysisId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM analysis_queue WHERE job_id = $1 AND state <> 'active'",
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keep the `keep` most recently finished entries in `state`.
    pub async fn prune_finished(
        pool: &PgPool,
        state: QueueState,
        keep: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM analysis_queue \
             WHERE job_id IN ( \
                 SELECT job_id FROM analysis_queue \
                 WHERE state = $1 \
                 ORDER BY finished_at DESC NULLS LAST \
                 OFFSET $2 \
             )",
        )
        .bind(state.as_str())
        .bind(keep)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_by_state(pool: &PgPool) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as("SELECT state, COUNT(*) FROM analysis_queue GROUP BY state")
            .fetch_all(pool)
            .await
    }
}
