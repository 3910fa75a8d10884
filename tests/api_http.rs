// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

mod common;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use common::*;
use serde_json::{json, Value as Json};
use tower::ServiceExt as _;

use linkpost_sync::{api, AppState};

const BODY_LIMIT: usize = 1024 * 1024;

fn test_router() -> Router {
    let h = HarnessBuilder::new()
        .post("spins", post_config("spins", &[SOURCE]))
        .pages(&[(SOURCE, heading_page(&[("A", "https://a.test/1"), ("B", "https://b.test/2")]))])
        .document("main", "100", EMPTY_BODY)
        .build();
    api::router(AppState {
        orchestrator: h.orchestrator,
    })
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Json) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, v)
}

fn post_json(uri: &str, v: Json) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(v.to_string()))
        .expect("build request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("build request")
}

#[tokio::test]
async fn health_returns_ok() {
    let app = test_router();
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn sync_batch_then_status_and_logs() {
    let app = test_router();
    let (code, v) = call(
        &app,
        post_json("/batches", json!({ "post_ids": ["spins"], "target": "all", "sync": true })),
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    let id = v["request_id"].as_str().unwrap().to_string();
    assert_eq!(v["status"]["overall_status"], "success");
    assert_eq!(v["status"]["posts"]["spins"]["links_added"], 2);
    assert_eq!(v["status"]["target"], "all");

    let (code, v) = call(&app, get(&format!("/batches/{id}"))).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(v["posts"]["spins"]["status"], "success");
    assert_eq!(v["posts"]["spins"]["targets"]["main"]["status"], "success");

    let (code, v) = call(&app, get(&format!("/batches/{id}/posts/spins/logs?tail=1"))).await;
    assert_eq!(code, StatusCode::OK);
    let lines = v.as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].as_str().unwrap().contains("finished"));
}

#[tokio::test]
async fn async_batch_is_accepted_with_request_id() {
    let app = test_router();
    let (code, v) = call(&app, post_json("/batches", json!({ "post_ids": ["spins"] }))).await;
    assert_eq!(code, StatusCode::ACCEPTED);
    assert!(v["request_id"].as_str().is_some());
    assert!(v.get("status").is_none());
}

#[tokio::test]
async fn manual_links_endpoint_counts_duplicates() {
    let app = test_router();
    let body = json!({ "links": [{ "title": "Mine", "url": "https://m.test/1" }] });
    let (code, v) = call(&app, post_json("/posts/spins/links", body.clone())).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!((v["added"].as_u64(), v["duplicates"].as_u64()), (Some(1), Some(0)));

    let (_, v) = call(&app, post_json("/posts/spins/links", body)).await;
    assert_eq!((v["added"].as_u64(), v["duplicates"].as_u64()), (Some(0), Some(1)));
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let app = test_router();

    let (code, v) = call(&app, get("/batches/does-not-exist")).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
    assert_eq!(v["kind"], "not_found");

    let (code, v) = call(
        &app,
        post_json("/posts/spins/links", json!({ "links": [{ "title": "x", "url": "nope" }] })),
    )
    .await;
    assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(v["kind"], "validation_error");

    let (code, _) = call(
        &app,
        post_json("/posts/ghost/links", json!({ "links": [{ "title": "x", "url": "https://x.test/" }] })),
    )
    .await;
    assert_eq!(code, StatusCode::NOT_FOUND);

    let (code, _) = call(&app, post_json("/batches", json!({ "post_ids": [] }))).await;
    assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);

    let (code, v) = call(
        &app,
        post_json("/posts/spins/links", json!({ "links": [{ "title": "x", "url": "https://x.test/" }], "target": "nowhere" })),
    )
    .await;
    assert_eq!(code, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(v["kind"], "target_unavailable");
}
