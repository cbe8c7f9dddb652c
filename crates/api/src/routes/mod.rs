pub mod analyses;
pub mod health;
pub mod queue;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /analyses                        list, newest first
/// /analyses/{id}                   get detail, delete
/// /analyses/{id}/progress          current progress view
/// /analyses/{id}/process           (re)queue for processing (POST)
/// /queue/status                    queue counts
/// ```
///
/// The progress stream is mounted separately by
/// [`analyses::stream_router`] because it must not be subject to the
/// request timeout.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/analyses", analyses::router())
        .nest("/queue", queue::router())
}
