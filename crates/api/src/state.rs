use std::sync::Arc;

use threatlens_events::ProgressBus;
use threatlens_pipeline::AnalysisService;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone: every field is behind an `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub service: AnalysisService,
    /// Progress published by the embedded worker pool.
    pub bus: Arc<ProgressBus>,
    pub config: Arc<ServerConfig>,
    /// Cancelled on shutdown so open progress streams end.
    pub shutdown: CancellationToken,
}
