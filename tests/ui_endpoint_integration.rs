//! Exercises the UI endpoint's HTTP snapshot routes (§4.4) in-process via
//! `tower::ServiceExt::oneshot`, without binding a real socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use saltpeter::state::SharedState;
use saltpeter::types::{ConfigSnapshot, CronDefinition, TargetType};
use saltpeter::ui_endpoint::UiEndpoint;
use serde_json::Value;
use tower::ServiceExt;

fn sample_cron(name: &str) -> CronDefinition {
    CronDefinition {
        name: name.to_string(),
        sec: "0".into(),
        min: "*".into(),
        hour: "*".into(),
        dom: "*".into(),
        mon: "*".into(),
        dow: "*".into(),
        year: "*".into(),
        command: "echo hi".into(),
        cwd: "/".into(),
        user: "root".into(),
        targets: vec!["a".into()],
        target_type: TargetType::List,
        number_of_targets: 0,
        soft_timeout: 0,
        hard_timeout: 0,
        group: None,
        source_file: std::path::PathBuf::new(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn version_reports_the_crate_version() {
    let state = SharedState::new();
    let router = UiEndpoint::new(state).router();
    let response = router
        .oneshot(Request::get("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn config_reports_crons_and_serial() {
    let state = SharedState::new();
    let mut crons = std::collections::HashMap::new();
    crons.insert("foo".to_string(), sample_cron("foo"));
    state.config.store(Arc::new(ConfigSnapshot { crons, serial: 7 }));

    let router = UiEndpoint::new(state).router();
    let response = router
        .oneshot(Request::get("/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["serial"], 7);
    assert_eq!(json["crons"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn running_starts_empty() {
    let state = SharedState::new();
    let router = UiEndpoint::new(state).router();
    let response = router
        .oneshot(Request::get("/running").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn timeline_starts_empty() {
    let state = SharedState::new();
    let router = UiEndpoint::new(state).router();
    let response = router
        .oneshot(Request::get("/timeline").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let json = body_json(response).await;
    assert_eq!(json["id"], 0);
    assert_eq!(json["entries"].as_array().unwrap().len(), 0);
}
