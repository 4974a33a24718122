//! Device API routes exercised through `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use fleet_hub::{
    AppState, Hub, HubSettings, MemoryEvents, MemoryStore, StaticRegistry, build_router,
};
use fleet_protocol::{CommandStatus, generate_id};
use http_body_util::BodyExt;
use hub_api_types::{ApiErrorBody, CommandResponse, DeviceSnapshot};
use serde_json::{Value, json};
use tower::ServiceExt;

const DEVICE: &str = "router-1";
const TOKEN: &str = "admin-secret";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
}

fn app_with(settings: HubSettings, token: Option<&str>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(StaticRegistry::new().with_device(DEVICE, "owner-1", "k1"));
    let hub = Hub::new(
        settings,
        store.clone(),
        registry,
        Arc::new(MemoryEvents::new(16)),
    );
    let mut state = AppState::new(hub);
    if let Some(token) = token {
        state = state.with_admin_token(token);
    }
    TestApp {
        router: build_router(state),
        store,
    }
}

fn app() -> TestApp {
    app_with(HubSettings::default(), Some(TOKEN))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn dispatch(router: &Router, body: &Value) -> (StatusCode, Vec<u8>) {
    send(
        router,
        post_json(&format!("/devices/{DEVICE}/commands"), body),
    )
    .await
}

#[tokio::test]
async fn health_is_public() {
    let app = app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn device_routes_require_the_admin_token() {
    let app = app();

    let missing = Request::builder()
        .uri(format!("/devices/{DEVICE}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, missing).await.0, StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri(format!("/devices/{DEVICE}"))
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, wrong).await.0, StatusCode::UNAUTHORIZED);

    let same_length = Request::builder()
        .uri(format!("/devices/{DEVICE}"))
        .header(header::AUTHORIZATION, "Bearer admin-secreT")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, same_length).await.0, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app.router, get(&format!("/devices/{DEVICE}"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn routes_are_open_without_a_configured_token() {
    let app = app_with(HubSettings::default(), None);
    let request = Request::builder()
        .uri(format!("/devices/{DEVICE}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app.router, request).await.0, StatusCode::OK);
}

#[tokio::test]
async fn offline_device_snapshot() {
    let app = app();
    let (status, body) = send(&app.router, get(&format!("/devices/{DEVICE}"))).await;
    assert_eq!(status, StatusCode::OK);

    let snapshot: DeviceSnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot.device.device_id, DEVICE);
    assert_eq!(snapshot.device.owner_id, "owner-1");
    assert!(!snapshot.connection.ready);
    assert!(!snapshot.connection.online);
    assert!(snapshot.status.is_none());
}

#[tokio::test]
async fn unregistered_device_is_not_found() {
    let app = app();
    let (status, body) = send(&app.router, get("/devices/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error: ApiErrorBody = serde_json::from_slice(&body).unwrap();
    assert!(error.error.contains("ghost"));
}

#[tokio::test]
async fn invalid_device_id_is_a_bad_request() {
    let app = app();
    let (status, _) = send(&app.router, get("/devices/bad%3Aid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dispatch_is_accepted_and_pollable() {
    let app = app();
    let (status, body) = dispatch(
        &app.router,
        &json!({"kind": "exec", "payload": {"command": "uptime"}, "ttl_secs": 60}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let accepted: CommandResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(accepted.command.status, CommandStatus::Pending);

    let (status, body) = send(
        &app.router,
        get(&format!(
            "/devices/{DEVICE}/commands/{}",
            accepted.command.command_id
        )),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let polled: CommandResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(polled.command, accepted.command);

    let (_, body) = send(&app.router, get(&format!("/devices/{DEVICE}"))).await;
    let snapshot: DeviceSnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(snapshot.connection.pending_commands, 1);
}

#[tokio::test]
async fn invalid_payload_is_unprocessable() {
    let app = app();
    let (status, _) = dispatch(
        &app.router,
        &json!({"kind": "upgrade", "payload": {"url": "https://x/img.bin"}}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn ttl_outside_bounds_is_unprocessable() {
    let app = app();
    let (status, _) = dispatch(&app.router, &json!({"kind": "reboot", "ttl_secs": 0})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = dispatch(
        &app.router,
        &json!({"kind": "reboot", "ttl_secs": 10_000_000}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn ttl_past_the_calendar_is_unprocessable() {
    let registry = Arc::new(StaticRegistry::new().with_device(DEVICE, "owner-1", "k1"));
    let hub = Hub::new(
        HubSettings::default(),
        Arc::new(MemoryStore::new()),
        registry,
        Arc::new(MemoryEvents::new(16)),
    );
    let mut state = AppState::new(hub).with_admin_token(TOKEN);
    state.max_command_ttl_secs = u64::MAX;
    let router = build_router(state);

    for ttl_secs in [u64::MAX, 9_000_000_000_000_000, 9_000_000_000_000] {
        let (status, _) = dispatch(&router, &json!({"kind": "reboot", "ttl_secs": ttl_secs})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY, "ttl_secs {ttl_secs}");
    }
}

#[tokio::test]
async fn full_queue_is_a_conflict() {
    let app = app_with(
        HubSettings {
            max_queue_depth: 1,
            ..HubSettings::default()
        },
        Some(TOKEN),
    );
    let (status, _) = dispatch(&app.router, &json!({"kind": "reboot"})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = dispatch(&app.router, &json!({"kind": "reboot"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn storage_failure_reports_the_failed_command() {
    let app = app();
    app.store.fail_writes(true);

    let (status, body) = dispatch(&app.router, &json!({"kind": "reboot"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let error: ApiErrorBody = serde_json::from_slice(&body).unwrap();
    let command_id = error.command_id.expect("failed command id");

    app.store.fail_writes(false);
    let (status, body) = send(
        &app.router,
        get(&format!("/devices/{DEVICE}/commands/{command_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let polled: CommandResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(polled.command.status, CommandStatus::Failed);
}

#[tokio::test]
async fn unknown_command_is_not_found() {
    let app = app();
    let (status, _) = send(
        &app.router,
        get(&format!("/devices/{DEVICE}/commands/{}", generate_id("cmd"))),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        get(&format!("/devices/{DEVICE}/commands/not-a-command")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn delete_clears_device_state() {
    let app = app();
    let (_, body) = dispatch(&app.router, &json!({"kind": "reboot"})).await;
    let accepted: CommandResponse = serde_json::from_slice(&body).unwrap();
    assert!(app.store.snapshot_text(DEVICE).is_some());

    let (status, _) = send(&app.router, delete(&format!("/devices/{DEVICE}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.store.snapshot_text(DEVICE).is_none());

    let (_, body) = send(
        &app.router,
        get(&format!(
            "/devices/{DEVICE}/commands/{}",
            accepted.command.command_id
        )),
    )
    .await;
    let polled: CommandResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(polled.command.status, CommandStatus::Failed);
}
