use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use threatlens_api::config::ServerConfig;
use threatlens_api::router::build_app_router;
use threatlens_api::state::AppState;
use threatlens_core::analysis::{AnalysisResult, DetectionMeta, DiagramImage, Locale};
use threatlens_core::progress::ProgressSnapshot;
use threatlens_core::types::AnalysisId;
use threatlens_db::{AnalysisStore, InMemoryAnalysisStore, InMemoryJobQueue, JobQueue, NewAnalysis};
use threatlens_events::ProgressBus;
use threatlens_pipeline::AnalysisService;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults and a short stream interval.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        progress_poll_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    }
}

/// In-memory backends behind the production router. No worker pool runs,
/// so queued analyses stay queued unless a test claims them.
pub struct TestApp {
    pub app: Router,
    pub service: AnalysisService,
    pub store: Arc<InMemoryAnalysisStore>,
    pub queue: Arc<InMemoryJobQueue>,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryAnalysisStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let service = AnalysisService::new(store.clone(), queue.clone());
        let config = test_config();

        let state = AppState {
            service: service.clone(),
            bus: Arc::new(ProgressBus::default()),
            config: Arc::new(config.clone()),
            shutdown: CancellationToken::new(),
        };
        let app = build_app_router(state, &config).expect("valid test config");

        Self {
            app,
            service,
            store,
            queue,
        }
    }

    pub async fn submit(&self) -> AnalysisId {
        self.service
            .submit(NewAnalysis {
                image: DiagramImage::new("diagram.png", "image/png", vec![0x89, 0x50]),
                language: Locale::EnUs,
            })
            .await
            .unwrap()
            .id
    }

    /// Drive `id` to completed as a worker would.
    pub async fn complete(&self, id: AnalysisId) {
        let claimed = self.queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.envelope.payload.analysis_id, id);

        let result = AnalysisResult::new(
            vec![],
            vec![],
            vec![],
            "aws",
            vec!["WAF".into()],
            DetectionMeta::default(),
        );
        self.store
            .complete(id, &ProgressSnapshot::completed(0), &result)
            .await
            .unwrap();
        self.queue.complete(id).await.unwrap();
    }
}

pub async fn send(app: &Router, method: Method, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri).await
}

pub async fn post(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::POST, uri).await
}

pub async fn delete(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri).await
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
