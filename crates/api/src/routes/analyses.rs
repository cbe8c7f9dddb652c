//! Handlers for the `/analyses` resource.
//!
//! Analyses are created by the upload gateway; this surface only reads
//! them, (re)queues them and deletes them.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use threatlens_core::analysis::{AnalysisJob, AnalysisListItem, AnalysisResult};
use threatlens_core::job_events::{EVENT_ANALYSIS_ERROR, EVENT_ANALYSIS_PROGRESS};
use threatlens_core::progress::{JobStatus, ProgressView};
use threatlens_core::types::AnalysisId;
use threatlens_pipeline::ProcessRequestOutcome;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_id(raw: &str) -> AppResult<AnalysisId> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid analysis id '{raw}'")))
}

/// Job record with its result once completed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDetail {
    #[serde(flatten)]
    pub job: AnalysisJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AnalysisResult>,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub status: &'static str,
    pub message: &'static str,
}

impl From<ProcessRequestOutcome> for ProcessResponse {
    fn from(outcome: ProcessRequestOutcome) -> Self {
        let status = match outcome {
            ProcessRequestOutcome::Queued => "queued",
            ProcessRequestOutcome::AlreadyCompleted => "already_completed",
            ProcessRequestOutcome::AlreadyProcessing => "already_processing",
        };
        Self {
            status,
            message: outcome.message(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/v1/analyses
///
/// Newest first. Provider and summary appear once an analysis completes.
async fn list_analyses(
    State(state): State<AppState>,
) -> AppResult<Json<DataResponse<Vec<AnalysisListItem>>>> {
    let items = state.service.list_analyses().await?;
    Ok(Json(DataResponse { data: items }))
}

/// GET /api/v1/analyses/{id}
async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<AnalysisDetail>>> {
    let id = parse_id(&id)?;
    let job = state.service.get_analysis(id).await?;
    let result = if job.status == JobStatus::Completed {
        state.service.get_result(id).await?
    } else {
        None
    };
    Ok(Json(DataResponse {
        data: AnalysisDetail { job, result },
    }))
}

/// GET /api/v1/analyses/{id}/progress
async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<ProgressView>>> {
    let id = parse_id(&id)?;
    let view = state.service.get_progress(id).await?;
    Ok(Json(DataResponse { data: view }))
}

/// POST /api/v1/analyses/{id}/process
///
/// 202 when a run was queued, 200 when nothing had to be done.
async fn process_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let outcome = state.service.process_analysis(id).await?;
    let status = match outcome {
        ProcessRequestOutcome::Queued => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((
        status,
        Json(DataResponse {
            data: ProcessResponse::from(outcome),
        }),
    ))
}

/// DELETE /api/v1/analyses/{id}
///
/// 409 while the analysis is running.
async fn delete_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = parse_id(&id)?;
    state.service.delete_analysis(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/analyses/{id}/progress/stream
///
/// Server-sent events, one per progress change. The stream ends after the
/// completed or failed view.
async fn stream_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let id = parse_id(&id)?;
    // Unknown ids get a 404 instead of a stream that synthesizes a failure.
    state.service.get_analysis(id).await?;

    let views = threatlens_events::watch_progress(
        state.service.store().clone(),
        &state.bus,
        id,
        state.config.progress_poll_interval,
    );
    tracing::debug!(analysis_id = %id, "Progress stream opened");

    let events = views
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|view| Ok(progress_event(&view)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn progress_event(view: &ProgressView) -> Event {
    let name = if view.status == JobStatus::Failed {
        EVENT_ANALYSIS_ERROR
    } else {
        EVENT_ANALYSIS_PROGRESS
    };
    match Event::default().event(name).json_data(view) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(analysis_id = %view.id, error = %e, "Failed to encode progress event");
            Event::default().event(name).data("{}")
        }
    }
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_analyses))
        .route("/{id}", get(get_analysis).delete(delete_analysis))
        .route("/{id}/progress", get(get_progress))
        .route("/{id}/process", post(process_analysis))
}

/// Long-lived routes mounted at the root, outside the request timeout.
///
/// `/stream` is kept as a shorter alias of `/progress/stream`.
pub fn stream_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/analyses/{id}/progress/stream", get(stream_progress))
        .route("/api/v1/analyses/{id}/stream", get(stream_progress))
}
