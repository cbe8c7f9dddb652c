//! Analysis progress, processing, deletion and queue status endpoints.

mod common;

use axum::http::StatusCode;
use common::{body_json, body_text, delete, get, post, TestApp};
use threatlens_core::progress::ProgressSnapshot;
use threatlens_db::{AnalysisStore, JobQueue};

#[tokio::test]
async fn progress_of_new_analysis_is_waiting() {
    let t = TestApp::new();
    let id = t.submit().await;

    let response = get(&t.app, &format!("/api/v1/analyses/{id}/progress")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["id"], id.to_string());
    assert_eq!(json["data"]["status"], "processing");
    assert_eq!(json["data"]["progress"]["stage"], "waiting");
    assert_eq!(json["data"]["progress"]["percentage"], 0);
}

#[tokio::test]
async fn unknown_analysis_returns_404_json() {
    let t = TestApp::new();
    let id = uuid::Uuid::new_v4();

    let response = get(&t.app, &format!("/api/v1/analyses/{id}/progress")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");

    let response = get(&t.app, &format!("/api/v1/analyses/{id}/progress/stream")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_id_returns_400() {
    let t = TestApp::new();
    let response = get(&t.app, "/api/v1/analyses/not-a-uuid/progress").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn process_reports_each_outcome() {
    let t = TestApp::new();
    let id = t.submit().await;
    let uri = format!("/api/v1/analyses/{id}/process");

    // Submission already queued it.
    let response = post(&t.app, &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "already_processing");

    t.complete(id).await;
    let response = post(&t.app, &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "already_completed");
}

#[tokio::test]
async fn process_requeues_failed_analysis() {
    let t = TestApp::new();
    let id = t.submit().await;
    t.queue.claim_next().await.unwrap().unwrap();
    t.store
        .fail(id, &ProgressSnapshot::failed("vision service down"), "vision service down")
        .await
        .unwrap();
    t.queue.complete(id).await.unwrap();

    let response = post(&t.app, &format!("/api/v1/analyses/{id}/process")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "queued");
    assert_eq!(json["data"]["message"], "Analysis queued for processing");
    assert_eq!(t.queue.counts().await.unwrap().waiting, 1);

    let json = body_json(get(&t.app, &format!("/api/v1/analyses/{id}/progress")).await).await;
    assert_eq!(json["data"]["status"], "processing");
    assert!(json["data"].get("error").is_none());
}

#[tokio::test]
async fn delete_removes_analysis() {
    let t = TestApp::new();
    let id = t.submit().await;

    let response = delete(&t.app, &format!("/api/v1/analyses/{id}")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = get(&t.app, &format!("/api/v1/analyses/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(t.queue.counts().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn delete_running_analysis_conflicts() {
    let t = TestApp::new();
    let id = t.submit().await;
    t.queue.claim_next().await.unwrap().unwrap();

    let response = delete(&t.app, &format!("/api/v1/analyses/{id}")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "CONFLICT");
}

#[tokio::test]
async fn queue_status_counts_entries() {
    let t = TestApp::new();
    t.submit().await;
    t.submit().await;
    t.queue.claim_next().await.unwrap().unwrap();

    let response = get(&t.app, "/api/v1/queue/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["waiting"], 1);
    assert_eq!(json["data"]["active"], 1);
}

#[tokio::test]
async fn completed_analysis_includes_result() {
    let t = TestApp::new();
    let id = t.submit().await;

    let response = get(&t.app, &format!("/api/v1/analyses/{id}")).await;
    let json = body_json(response).await;
    assert_eq!(json["data"]["imageName"], "diagram.png");
    assert!(json["data"].get("result").is_none());

    t.complete(id).await;
    let response = get(&t.app, &format!("/api/v1/analyses/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "completed");
    assert_eq!(json["data"]["result"]["detectedProvider"], "aws");
    assert_eq!(json["data"]["result"]["existingMitigations"][0], "WAF");
}

#[tokio::test]
async fn stream_of_completed_analysis_emits_terminal_event_and_ends() {
    let t = TestApp::new();
    let id = t.submit().await;
    t.complete(id).await;

    let response = get(&t.app, &format!("/api/v1/analyses/{id}/progress/stream")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let body = body_text(response).await;
    assert!(body.contains("analysis.progress"));
    assert!(body.contains("\"status\":\"completed\""));
    assert_eq!(body.matches("event:").count(), 1);
}

#[tokio::test]
async fn stream_alias_serves_the_same_events() {
    let t = TestApp::new();
    let id = t.submit().await;
    t.complete(id).await;

    let response = get(&t.app, &format!("/api/v1/analyses/{id}/stream")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("\"status\":\"completed\""));
}

#[tokio::test]
async fn list_returns_analyses_newest_first() {
    let t = TestApp::new();
    let response = get(&t.app, "/api/v1/analyses").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"], serde_json::json!([]));

    let older = t.submit().await;
    let newer = t.submit().await;
    t.complete(older).await;

    let response = get(&t.app, "/api/v1/analyses").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let items = json["data"].as_array().unwrap();
    assert_eq!(items.len(), 2);

    assert_eq!(items[0]["id"], newer.to_string());
    assert_eq!(items[0]["status"], "processing");
    assert_eq!(items[0]["progress"]["stage"], "waiting");
    assert!(items[0].get("summary").is_none());
    assert!(items[0].get("detectedProvider").is_none());

    assert_eq!(items[1]["id"], older.to_string());
    assert_eq!(items[1]["imageName"], "diagram.png");
    assert_eq!(items[1]["status"], "completed");
    assert_eq!(items[1]["detectedProvider"], "aws");
    assert_eq!(items[1]["summary"]["totalThreats"], 0);
    assert!(items[1].get("createdAt").is_some());
    // Heavy fields stay out of the listing.
    assert!(items[1].get("result").is_none());
    assert!(items[1].get("components").is_none());
}
