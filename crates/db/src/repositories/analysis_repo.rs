//! Repository for the `analyses` table.

use sqlx::PgPool;
use threatlens_core::progress::JobStatus;
use threatlens_core::types::AnalysisId;

use crate::models::analysis::{AnalysisListRow, AnalysisRow, ImageRow};

/// Column list for job queries. Image bytes and result are loaded
/// separately since they can be large.
const COLUMNS: &str = "\
    id, image_name, language, status, progress, error_message, \
    created_at, updated_at";

/// Provides CRUD operations for analyses.
pub struct AnalysisRepo;

impl AnalysisRepo {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        pool: &PgPool,
        id: AnalysisId,
        image_name: &str,
        image_mime_type: &str,
        image_data: &[u8],
        language: &str,
        progress: &serde_json::Value,
    ) -> Result<AnalysisRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO analyses \
                 (id, image_name, image_mime_type, image_data, language, status, progress) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, AnalysisRow>(&query)
            .bind(id)
            .bind(image_name)
            .bind(image_mime_type)
            .bind(image_data)
            .bind(language)
            .bind(JobStatus::Processing.as_str())
            .bind(progress)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: AnalysisId,
    ) -> Result<Option<AnalysisRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM analyses WHERE id = $1");
        sqlx::query_as::<_, AnalysisRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Listing rows, newest first.
    pub async fn list(pool: &PgPool) -> Result<Vec<AnalysisListRow>, sqlx::Error> {
        sqlx::query_as::<_, AnalysisListRow>(
            "SELECT id, image_name, result->>'detectedProvider' AS detected_provider, \
                    status, result->'summary' AS summary, progress, created_at \
             FROM analyses \
             ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(pool)
        .await
    }

    pub async fn find_image(
        pool: &PgPool,
        id: AnalysisId,
    ) -> Result<Option<ImageRow>, sqlx::Error> {
        sqlx::query_as::<_, ImageRow>(
            "SELECT image_name, image_mime_type, image_data FROM analyses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_result(
        pool: &PgPool,
        id: AnalysisId,
    ) -> Result<Option<serde_json::Value>, sqlx::Error> {
        let row: Option<(Option<serde_json::Value>,)> =
            sqlx::query_as("SELECT result FROM analyses WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(row.and_then(|(result,)| result))
    }

    /// Back to `processing` with a fresh snapshot; error and result cleared.
    /// Returns `false` if no row matched.
    pub async fn reset(
        pool: &PgPool,
        id: AnalysisId,
        progress: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analyses \
             SET status = $2, progress = $3, error_message = NULL, result = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .bind(progress)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_progress(
        pool: &PgPool,
        id: AnalysisId,
        progress: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analyses SET status = $2, progress = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Processing.as_str())
        .bind(progress)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Status, snapshot and result in one statement.
    pub async fn complete(
        pool: &PgPool,
        id: AnalysisId,
        progress: &serde_json::Value,
        result_json: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analyses \
             SET status = $2, progress = $3, result = $4, error_message = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Completed.as_str())
        .bind(progress)
        .bind(result_json)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn fail(
        pool: &PgPool,
        id: AnalysisId,
        progress: &serde_json::Value,
        error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE analyses \
             SET status = $2, progress = $3, error_message = $4, result = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Failed.as_str())
        .bind(progress)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(pool: &PgPool, id: AnalysisId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM analyses WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
