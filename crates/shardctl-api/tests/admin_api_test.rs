//! Admin routes served against in-memory shards.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use shardctl_api::{app, AppState};
use shardctl_core::mock::{test_shards, MemoryConnector, MemoryShard};
use shardctl_db::ShardRouter;
use shardctl_health::{HealthChecker, HealthCheckerConfig};
use shardctl_migrate::MigrationRegistry;

fn state(connector: &MemoryConnector, shards: i32) -> AppState {
    let router = ShardRouter::new(test_shards(shards), Arc::new(connector.clone())).unwrap();
    let checker = HealthChecker::new(Arc::new(router), HealthCheckerConfig::default());
    AppState::new(checker, MigrationRegistry::new())
}

async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_start_then_poll_migration() {
    let source = MemoryShard::new().with_rows("orders", 30);
    let target = MemoryShard::new();
    let connector = MemoryConnector::new()
        .with_shard(0, source)
        .with_shard(2, target.clone());
    let state = state(&connector, 3);

    let (status, body) = call(
        &state,
        "POST",
        "/api/v1/admin/migrations",
        Some(json!({"source_shard_id": 0, "target_shard_id": 2, "batch_size": 10})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["message"], "Migration started in background");
    let id = body["migration_id"].as_str().unwrap().to_string();
    assert!(id.starts_with("migration_0_to_2_"));

    state.registry.wait(&id).await.unwrap();

    let (status, body) = call(&state, "GET", &format!("/api/v1/admin/migrations/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["total_records"], 30);
    assert_eq!(body["migrated"], 30);
    assert_eq!(body["verified"], 30);
    assert_eq!(target.row_count("orders"), 30);

    let (status, body) = call(&state, "GET", "/api/v1/admin/migrations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["migrations"][0]["migration_id"], id.as_str());
}

#[tokio::test]
async fn test_start_rejects_bad_requests() {
    let state = state(&MemoryConnector::new(), 2);

    let (status, body) = call(
        &state,
        "POST",
        "/api/v1/admin/migrations",
        Some(json!({"source_shard_id": 1, "target_shard_id": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("must be different"));

    let (status, body) = call(
        &state,
        "POST",
        "/api/v1/admin/migrations",
        Some(json!({"source_shard_id": 0, "target_shard_id": 7})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Shard not found: 7");

    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_unreachable_shard_is_unavailable() {
    let state = state(&MemoryConnector::new().with_unreachable(1), 2);

    let (status, body) = call(
        &state,
        "POST",
        "/api/v1/admin/migrations",
        Some(json!({"source_shard_id": 0, "target_shard_id": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("shard 1"));
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_migration_and_cancel() {
    let source = MemoryShard::new()
        .with_rows("orders", 300)
        .with_fetch_delay(Duration::from_millis(10));
    let target = MemoryShard::new();
    let connector = MemoryConnector::new()
        .with_shard(0, source)
        .with_shard(1, target.clone());
    let state = state(&connector, 3);

    let (_, body) = call(
        &state,
        "POST",
        "/api/v1/admin/migrations",
        Some(json!({"source_shard_id": 0, "target_shard_id": 1, "batch_size": 100})),
    )
    .await;
    let id = body["migration_id"].as_str().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(15)).await;

    let (status, _) = call(
        &state,
        "POST",
        "/api/v1/admin/migrations",
        Some(json!({"source_shard_id": 2, "target_shard_id": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(&state, "GET", "/api/v1/admin/shards/1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["active_migration"]["migration_id"], id.as_str());

    let (status, body) = call(
        &state,
        "POST",
        &format!("/api/v1/admin/migrations/{}/cancel?purge=true", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "rolled_back");
    assert_eq!(body["message"], "Migration cancellation initiated");
    assert_eq!(target.row_count("orders"), 0);

    let (status, body) = call(
        &state,
        "POST",
        &format!("/api/v1/admin/migrations/{}/cancel", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Invalid input: Cannot cancel migration that is already rolled_back"
    );
}

#[tokio::test]
async fn test_unknown_migration_and_shard() {
    let state = state(&MemoryConnector::new(), 2);

    let (status, body) = call(&state, "GET", "/api/v1/admin/migrations/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Migration not found: missing");

    let (status, _) = call(&state, "POST", "/api/v1/admin/migrations/missing/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&state, "GET", "/api/v1/admin/shards/9/stats", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Shard not found: 9");
}

#[tokio::test]
async fn test_shard_stats_reports_ping_failure() {
    let shard = MemoryShard::new();
    let state = state(&MemoryConnector::new().with_shard(0, shard.clone()), 1);

    let (_, body) = call(&state, "GET", "/api/v1/admin/shards/0/stats", None).await;
    assert_eq!(body["healthy"], true);
    assert!(body.get("error").is_none());

    // The cached connection stays open; only its ping now fails.
    let _ = shard.with_ping_error("server closed the connection");
    let (status, body) = call(&state, "GET", "/api/v1/admin/shards/0/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], false);
    assert!(body["error"].as_str().unwrap().contains("server closed the connection"));
}

#[tokio::test]
async fn test_health_and_metrics() {
    let state = state(&MemoryConnector::new().with_unreachable(1), 2);

    let (status, body) = call(&state, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_shards"], 2);

    state.checker.check_all_shards().await;
    let (status, body) = call(&state, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["unhealthy_shards"], 1);

    let (_, shards) = call(&state, "GET", "/api/v1/admin/shards", None).await;
    assert_eq!(shards["system"]["total_shards"], 2);

    let response = app(state.clone())
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; version=0.0.4"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("system_shards_unhealthy 1\n"));
}
