//! Client tests against in-process fake services.

use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use threatlens_core::analysis::{DiagramImage, Locale};
use threatlens_core::component::{ComponentType, DetectedComponent};
use threatlens_core::threat::StrideCategory;
use threatlens_detectors::{
    AnalystError, DetectorError, ObjectDetectorClient, PrimaryDetector, SecondaryDetector,
    ThreatAnalyst, ThreatRequest, VisionServiceClient,
};

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn image() -> DiagramImage {
    DiagramImage::new("diagram.png", "image/png", vec![0x89, b'P', b'N', b'G'])
}

fn request() -> ThreatRequest {
    let component = DetectedComponent::new("db", "Orders DB", ComponentType::Database);
    ThreatRequest::for_component(&component, &[], "aws", &[], Locale::EnUs)
}

#[tokio::test]
async fn primary_detection_parses_fenced_response() {
    let app = Router::new().route(
        "/detect-components",
        post(|| async {
            "Here is the architecture:\n```json\n{\"detectedProvider\": \"azure\", \
             \"components\": [{\"id\": \"app\", \"name\": \"App\", \"type\": \"server\"}], \
             \"connections\": []}\n```"
        }),
    );
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_secs(5));

    let detection = client.detect(&image(), Locale::PtBr).await.unwrap();
    assert_eq!(detection.provider, "azure");
    assert_eq!(detection.components.len(), 1);
    assert_eq!(detection.components[0].component_type, ComponentType::Server);
}

#[tokio::test]
async fn primary_detection_surfaces_api_errors() {
    let app = Router::new().route(
        "/detect-components",
        post(|| async { (StatusCode::BAD_GATEWAY, "model offline") }),
    );
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_secs(5));

    let err = client.detect(&image(), Locale::EnUs).await.unwrap_err();
    assert_matches!(err, DetectorError::Api { status: 502, ref body } if body == "model offline");
}

#[tokio::test]
async fn analyst_posts_request_and_parses_threats() {
    let app = Router::new().route(
        "/analyze-threats",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["component"]["id"], "db");
            assert_eq!(body["provider"], "aws");
            assert_eq!(body["locale"], "en-US");
            Json(json!({
                "threats": [{
                    "category": "Information Disclosure",
                    "description": "Unencrypted backups",
                    "severity": "high",
                    "countermeasures": ["Encrypt at rest"]
                }]
            }))
        }),
    );
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_secs(5));

    let threats = client.analyze(&request()).await.unwrap();
    assert_eq!(threats.len(), 1);
    assert_eq!(threats[0].category, StrideCategory::InformationDisclosure);
}

#[tokio::test]
async fn analyst_classifies_auth_and_server_failures() {
    let app = Router::new()
        .route(
            "/analyze-threats",
            post(|| async { (StatusCode::UNAUTHORIZED, "bad key") }),
        );
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_secs(5));
    assert_matches!(client.analyze(&request()).await, Err(AnalystError::Fatal(_)));

    let app = Router::new().route(
        "/analyze-threats",
        post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
    );
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_secs(5));
    assert_matches!(
        client.analyze(&request()).await,
        Err(AnalystError::Transient(_))
    );

    let app = Router::new().route("/analyze-threats", post(|| async { "I refuse." }));
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_secs(5));
    assert_matches!(
        client.analyze(&request()).await,
        Err(AnalystError::Malformed(_))
    );
}

#[tokio::test]
async fn slow_service_times_out() {
    let app = Router::new().route(
        "/analyze-threats",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "{}"
        }),
    );
    let base = serve(app).await;
    let client = VisionServiceClient::new(base, Duration::from_millis(100));

    let err = client.analyze(&request()).await.unwrap_err();
    assert_matches!(err, AnalystError::Transient(ref msg) if msg.contains("timed out"));
}

#[tokio::test]
async fn object_detector_probe_and_predict() {
    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(json!({"status": "ok", "model_loaded": true})) }),
        )
        .route(
            "/predict",
            post(|Query(params): Query<HashMap<String, String>>| async move {
                assert_eq!(params.get("confidence").map(String::as_str), Some("0.05"));
                Json(json!({
                    "inference_time_ms": 12.0,
                    "total_detections": 1,
                    "detections": [
                        {"class_name": "cache", "backend_type": "cache", "confidence": 0.7}
                    ]
                }))
            }),
        );
    let base = serve(app).await;
    let client =
        ObjectDetectorClient::new(base, Duration::from_secs(1), Duration::from_secs(5));

    assert!(client.probe().await.unwrap());
    let prediction = client.detect(&image(), 0.05).await.unwrap();
    assert_eq!(prediction.total_detections, 1);
    assert_eq!(prediction.detections[0].type_code, ComponentType::Cache);
    assert_eq!(prediction.inference_time_ms, Some(12.0));
}

#[tokio::test]
async fn probe_reports_unloaded_model() {
    let app = Router::new().route(
        "/health",
        get(|| async { Json(json!({"status": "loading", "model_loaded": false})) }),
    );
    let base = serve(app).await;
    let client =
        ObjectDetectorClient::new(base, Duration::from_secs(1), Duration::from_secs(5));

    assert!(!client.probe().await.unwrap());
}

#[tokio::test]
async fn probe_of_unreachable_service_errors() {
    // Bind then drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ObjectDetectorClient::new(
        format!("http://{addr}/"),
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    assert!(client.probe().await.is_err());
}
