use axum::extract::State;
use axum::{routing::get, Json, Router};
use threatlens_core::queue::QueueCounts;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/queue/status
async fn queue_status(State(state): State<AppState>) -> AppResult<Json<DataResponse<QueueCounts>>> {
    let counts = state.service.queue_counts().await?;
    Ok(Json(DataResponse { data: counts }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(queue_status))
}
