//! End-to-end watch flows: reconciliation, live updates, cache-busting

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use lifehub_common::config::{BackoffConfig, TomlConfig};
use lifehub_common::events::EventBus;
use lifehub_common::EntityRef;
use serde_json::json;
use std::time::Duration;
use tower::util::ServiceExt;

/// Test helper: app with fast retry budget so lagging-store tests finish
/// quickly
async fn create_test_app() -> (axum::Router, sqlx::SqlitePool) {
    let pool = sqlx::SqlitePool::connect(":memory:")
        .await
        .expect("Failed to create in-memory database");
    lifehub_sync::db::init_schema(&pool)
        .await
        .expect("Failed to initialize database schema");

    let config = TomlConfig {
        backoff: BackoffConfig {
            max_attempts: 2,
            initial_delay_ms: 5,
            max_delay_ms: 10,
        },
        ..TomlConfig::default()
    };
    let event_bus = EventBus::new(100);
    let state = lifehub_sync::AppState::new(pool.clone(), event_bus, &config);
    (lifehub_sync::build_router(state), pool)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

async fn get(app: &axum::Router, uri: &str) -> serde_json::Value {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

async fn submit_hinted_job(app: &axum::Router, entity_id: &str) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/jobs",
            &json!({
                "kind": "image_generation",
                "metadata": {
                    "correlation": { "entity_type": "character", "entity_id": entity_id }
                }
            }),
        ))
        .await
        .unwrap();
    let job = json_body(response).await;
    job["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_preview_sequence_for_pre_submitted_job() {
    let (app, pool) = create_test_app().await;

    // entity with an existing asset, job submitted before anyone watches
    lifehub_sync::db::entities::put_entity(
        &pool,
        &EntityRef::new("character", "c1"),
        &json!({ "name": "Alice", "asset_ref": "https://assets/c1/v1.png" }),
    )
    .await
    .unwrap();
    let job_id = submit_hinted_job(&app, "c1").await;

    // reconciliation on subscribe must surface the job immediately
    let response = app
        .clone()
        .oneshot(post_json(
            "/watch",
            &json!({ "entity_type": "character", "entity_id": "c1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let watch = json_body(response).await;
    let watch_id = watch["watch_id"].as_str().unwrap().to_string();
    assert_eq!(watch["preview"]["phase"], "discovered");
    assert_eq!(watch["preview"]["progress"], serde_json::Value::Null);

    // worker reports progress
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/jobs/{}/status", job_id),
            &json!({ "status": "running", "progress": 40 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let preview = get(&app, &format!("/watch/{}", watch_id)).await;
    assert_eq!(preview["phase"], "generating");
    assert_eq!(preview["progress"], 40);

    // worker persists the asset to the record, then reports completion
    lifehub_sync::db::entities::put_entity(
        &pool,
        &EntityRef::new("character", "c1"),
        &json!({ "name": "Alice", "asset_ref": "https://assets/c1/v2.png" }),
    )
    .await
    .unwrap();
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/jobs/{}/status", job_id),
            &json!({
                "status": "completed",
                "progress": 100,
                "result": { "asset_ref": "https://assets/c1/v2.png" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let preview = get(&app, &format!("/watch/{}", watch_id)).await;
    assert_eq!(preview["phase"], "completed");
    let url = preview["asset_url"].as_str().unwrap();
    assert!(
        url.starts_with("https://assets/c1/v2.png?v="),
        "new asset must carry a cache-busting version, got {}",
        url
    );
    assert_eq!(preview["tracked_job_id"], serde_json::Value::Null);
    assert_eq!(preview["last_error"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_failed_job_keeps_previous_asset() {
    let (app, pool) = create_test_app().await;

    lifehub_sync::db::entities::put_entity(
        &pool,
        &EntityRef::new("character", "c1"),
        &json!({ "name": "Alice", "asset_ref": "https://assets/c1/v1.png" }),
    )
    .await
    .unwrap();

    let response = app
        .clone()
        .oneshot(post_json(
            "/watch",
            &json!({ "entity_type": "character", "entity_id": "c1" }),
        ))
        .await
        .unwrap();
    let watch = json_body(response).await;
    let watch_id = watch["watch_id"].as_str().unwrap().to_string();
    assert_eq!(watch["preview"]["phase"], "idle");
    let initial_url = watch["preview"]["asset_url"].as_str().unwrap().to_string();

    let job_id = submit_hinted_job(&app, "c1").await;
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/jobs/{}/status", job_id),
            &json!({ "status": "failed", "error": "provider timeout" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let preview = get(&app, &format!("/watch/{}", watch_id)).await;
    assert_eq!(preview["phase"], "failed");
    assert_eq!(preview["last_error"], "provider timeout");
    assert_eq!(preview["asset_url"], initial_url.as_str());
}

#[tokio::test]
async fn test_completion_with_lagging_asset_store_surfaces_delay() {
    let (app, _pool) = create_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/watch",
            &json!({ "entity_type": "character", "entity_id": "c1" }),
        ))
        .await
        .unwrap();
    let watch = json_body(response).await;
    let watch_id = watch["watch_id"].as_str().unwrap().to_string();

    // completion announces an asset the entity record never receives
    let job_id = submit_hinted_job(&app, "c1").await;
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/jobs/{}/status", job_id),
            &json!({
                "status": "completed",
                "result": { "asset_ref": "https://assets/c1/v2.png" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let preview = get(&app, &format!("/watch/{}", watch_id)).await;
    // the completion is still applied; the exhausted retry budget is
    // reported instead of leaving the preview stuck
    assert_eq!(preview["phase"], "completed");
    assert!(preview["last_error"]
        .as_str()
        .unwrap()
        .contains("not yet readable"));
}

#[tokio::test]
async fn test_legacy_result_entity_id_matches() {
    let (app, _pool) = create_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/watch",
            &json!({ "entity_type": "character", "entity_id": "c1" }),
        ))
        .await
        .unwrap();
    let watch = json_body(response).await;
    let watch_id = watch["watch_id"].as_str().unwrap().to_string();

    // no structured hint anywhere; only the legacy result field
    let response = app
        .clone()
        .oneshot(post_json(
            "/jobs",
            &json!({ "kind": "image_generation", "metadata": { "prompt": "portrait" } }),
        ))
        .await
        .unwrap();
    let job = json_body(response).await;
    let job_id = job["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/jobs/{}/status", job_id),
            &json!({ "status": "completed", "result": { "entity_id": "c1" } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let preview = get(&app, &format!("/watch/{}", watch_id)).await;
    assert_eq!(preview["phase"], "completed");
}

#[tokio::test]
async fn test_delete_watch_stops_session() {
    let (app, _pool) = create_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/watch",
            &json!({ "entity_type": "character", "entity_id": "c1" }),
        ))
        .await
        .unwrap();
    let watch = json_body(response).await;
    let watch_id = watch["watch_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/watch/{}", watch_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/watch/{}", watch_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
