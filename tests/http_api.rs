// HTTP-level tests: spin the router up on an ephemeral port and drive it
// with a real client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use matchpoint_backend::api;
use matchpoint_backend::config::MatchmakingConfig;
use matchpoint_backend::db::Database;
use matchpoint_backend::session::MatchService;

/// Spin up a test server on a random port, return the base URL and a handle
/// to its in-memory store.
async fn start_server(cfg: MatchmakingConfig) -> (String, Arc<Database>) {
    sqlx::any::install_default_drivers();
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let service = MatchService::new(db.clone(), cfg);
    let app = api::router(service);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), db)
}

fn fast_cfg() -> MatchmakingConfig {
    MatchmakingConfig {
        timeout_secs: 0.3,
        poll_interval_secs: 0.05,
        ..MatchmakingConfig::default()
    }
}

#[tokio::test]
async fn test_health() {
    let (base, _db) = start_server(fast_cfg()).await;
    let body: Value = reqwest::get(format!("{base}/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({ "ok": true }));
}

#[tokio::test]
async fn test_direct_match_lifecycle() {
    let (base, db) = start_server(fast_cfg()).await;
    let client = reqwest::Client::new();

    let p1 = db.create_user("ana", 1000, "NA", &[]).await.unwrap();
    let p2 = db.create_user("ben", 1000, "NA", &[]).await.unwrap();

    let resp = client
        .post(format!("{base}/match/start"))
        .json(&json!({ "user_a": p1.id, "user_b": p2.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    let match_id = body["match_id"].as_i64().unwrap();

    // Starting again while both are bound is a conflict
    let resp = client
        .post(format!("{base}/match/start"))
        .json(&json!({ "user_a": p1.id, "user_b": p2.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("{base}/match/finish"))
        .json(&json!({ "match_id": match_id, "score": [11, 5] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["rating_before"], json!([1000, 1000]));
    assert_eq!(body["rating_after"], json!([1016, 984]));

    // Cancelling a finished match is a conflict
    let resp = reqwest::get(format!("{base}/match/cancel/{match_id}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let body: Value = reqwest::get(format!("{base}/api/matches/{match_id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "finished");
    assert_eq!(body["score_a"], 11);
    assert_eq!(body["score_b"], 5);
}

#[tokio::test]
async fn test_cancel_active_match() {
    let (base, db) = start_server(fast_cfg()).await;
    let client = reqwest::Client::new();

    let p1 = db.create_user("a", 1000, "NA", &[]).await.unwrap();
    let p2 = db.create_user("b", 1000, "NA", &[]).await.unwrap();
    let resp = client
        .post(format!("{base}/match/start"))
        .json(&json!({ "user_a": p1.id, "user_b": p2.id }))
        .send()
        .await
        .unwrap();
    let match_id = resp.json::<Value>().await.unwrap()["match_id"]
        .as_i64()
        .unwrap();

    let resp = reqwest::get(format!("{base}/match/cancel/{match_id}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({ "ok": true }));

    // A cancelled match cannot be finished
    let resp = client
        .post(format!("{base}/match/finish"))
        .json(&json!({ "match_id": match_id, "score": [1, 0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn test_error_codes() {
    let (base, db) = start_server(fast_cfg()).await;
    let client = reqwest::Client::new();

    let p1 = db.create_user("a", 1000, "NA", &[]).await.unwrap();

    // Unknown user on the enqueue endpoints is a bad request
    let resp = client
        .post(format!("{base}/match"))
        .json(&json!({ "user_id": 999_999 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{base}/match/start"))
        .json(&json!({ "user_a": p1.id, "user_b": 999_999 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown match is 404, malformed score is 400
    let resp = client
        .post(format!("{base}/match/finish"))
        .json(&json!({ "match_id": 999, "score": [1, 0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .post(format!("{base}/match/finish"))
        .json(&json!({ "match_id": 1, "score": [-3, 0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = reqwest::get(format!("{base}/match/cancel/4242")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_blocking_match_expires_in_empty_area() {
    let (base, db) = start_server(fast_cfg()).await;
    let client = reqwest::Client::new();

    let p1 = db.create_user("solo", 1000, "NA", &[]).await.unwrap();
    let resp = client
        .post(format!("{base}/match"))
        .json(&json!({ "user_id": p1.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "expired");
}

#[tokio::test]
async fn test_stream_ends_with_expired_event() {
    let (base, db) = start_server(fast_cfg()).await;
    let client = reqwest::Client::new();

    let p1 = db.create_user("solo", 1000, "NA", &[]).await.unwrap();
    let resp = client
        .post(format!("{base}/match/stream"))
        .json(&json!({ "user_id": p1.id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // The stream closes after the terminal event, so the whole body is
    // readable here.
    let body = resp.text().await.unwrap();
    assert!(body.contains(r#""type":"searching""#), "body: {body}");
    assert!(body.contains(r#""type":"expired""#), "body: {body}");
}

#[tokio::test]
async fn test_queue_status_endpoint() {
    let (base, _db) = start_server(fast_cfg()).await;
    let body: Value = reqwest::get(format!("{base}/api/queue/status?area=NA"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["depth"], 0);
    assert!(body["estimated_wait_seconds"].as_f64().unwrap() > 0.0);
}
