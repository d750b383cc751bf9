//! Gateway routes against the simulated bench.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use nim_core::Family;
use nim_server::{router, AppState};
use nim_session::{ManagerConfig, SessionManager, SimulatedBench};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn gateway(bench: SimulatedBench) -> Router {
    let bench = Arc::new(bench);
    let mut config = ManagerConfig::default();
    config.session.drain_ms = 1;
    config.session.shutdown_grace_ms = 100;
    let manager = SessionManager::new(config, bench.clone());
    router(AppState::new(manager, bench))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_and_ports() {
    let app = gateway(SimulatedBench::new(1, 1));

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "devices": 0}));

    let (status, body) = call(&app, "GET", "/api/ports", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([
            {"endpoint": "SIM-MSCF16-1", "description": "Simulated MSCF-16"},
            {"endpoint": "SIM-MHV4-1", "description": "Simulated MHV-4"},
        ])
    );
}

#[tokio::test]
async fn com3_session_over_http() {
    let app = gateway(SimulatedBench::with_ports(vec![("COM3".into(), Family::Mscf16)]));

    let (status, body) = call(
        &app,
        "POST",
        "/api/connect",
        Some(json!({"port": "COM3", "family": "mscf16"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["device_id"], json!("COM3"));

    let (status, body) = call(
        &app,
        "POST",
        "/api/command/COM3",
        Some(json!({"command": "get_version", "params": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    let updates = body["result"]["updates"].as_array().unwrap();
    assert!(updates.contains(&json!({"type": "version", "value": "5.3"})));

    let (status, body) = call(
        &app,
        "POST",
        "/api/command/COM3",
        Some(json!({"command": "set_threshold", "params": {"channel": 5, "value": 300}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"success": false, "error": "value out of range 0-255"}));

    let (status, body) = call(
        &app,
        "POST",
        "/api/command/COM3",
        Some(json!({"command": "set_threshold", "params": {"channel": 5, "value": 200}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["result"]["updates"],
        json!([{"type": "threshold", "channel": 5, "value": 200}])
    );

    let (status, body) = call(&app, "GET", "/api/devices/COM3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["family"], json!("mscf16"));
    assert!(body["values"]
        .as_array()
        .unwrap()
        .contains(&json!({"type": "threshold", "channel": 5, "value": 200})));

    let (status, body) = call(&app, "POST", "/api/disconnect/COM3", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    let (status, body) = call(&app, "POST", "/api/disconnect/COM3", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn conflicts_and_unknown_devices() {
    let app = gateway(SimulatedBench::new(1, 0));
    let connect = json!({"port": "SIM-MSCF16-1"});

    let (status, _) = call(&app, "POST", "/api/connect", Some(connect.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&app, "POST", "/api/connect", Some(connect)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("Device already connected: SIM-MSCF16-1"));

    let (status, body) = call(&app, "GET", "/api/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["device_id"], json!("SIM-MSCF16-1"));
    assert_eq!(body[0]["telemetry"], json!(false));

    let (status, _) = call(
        &app,
        "POST",
        "/api/command/nope",
        Some(json!({"command": "get_version"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &app,
        "POST",
        "/api/command/SIM-MSCF16-1",
        Some(json!({"command": "frobnicate", "params": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));

    let (status, _) = call(&app, "GET", "/api/devices/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn connect_errors() {
    let app = gateway(SimulatedBench::new(1, 0));

    let (status, body) = call(&app, "POST", "/api/connect", Some(json!({"port": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("port is required"));

    let (status, _) = call(
        &app,
        "POST",
        "/api/connect",
        Some(json!({"port": "SIM-MSCF16-1", "baud_rate": 300})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "POST", "/api/connect", Some(json!({"port": "COM9"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn mhv4_voltage_round_trip() {
    let app = gateway(SimulatedBench::new(0, 1));
    let (status, _) = call(
        &app,
        "POST",
        "/api/connect",
        Some(json!({"port": "SIM-MHV4-1", "family": "MHV-4", "device_id": "hv"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        "POST",
        "/api/command/hv",
        Some(json!({"command": "set_voltage", "params": {"channel": 1, "voltage": 250}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        "POST",
        "/api/command/hv",
        Some(json!({"command": "read_voltage_preset", "params": {"channel": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["result"]["updates"],
        json!([{"type": "voltage_preset", "channel": 1, "value": 250.0}])
    );

    let (status, body) = call(
        &app,
        "POST",
        "/api/command/hv",
        Some(json!({"command": "set_voltage", "params": {"channel": 4, "voltage": 10}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("channel out of range 0-3"));

    let (status, _) = call(&app, "POST", "/api/disconnect/hv", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_bodies_use_the_error_envelope() {
    let app = gateway(SimulatedBench::new(1, 0));

    for (uri, raw) in [
        ("/api/connect", "{\"port\": "),
        ("/api/connect", "{\"baud_rate\": 9600}"),
        ("/api/command/SIM-MSCF16-1", "not json"),
    ] {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(raw))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri} {raw}");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], json!(false));
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request body"));
    }
}
