//! REST handlers.

use crate::error_mapping::ApiError;
use crate::AppState;
use axum::extract::{FromRequest, Path, State};
use axum::Json;
use nim_core::Command;
use nim_session::{ConnectRequest, DeviceSnapshot, PortInfo, SessionSummary};
use serde_json::{json, Value};
use tracing::info;

type ApiResult<T> = Result<T, ApiError>;

/// JSON body whose rejection is reported in the usual error envelope.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `GET /api/ports`
pub async fn list_ports(State(state): State<AppState>) -> Json<Vec<PortInfo>> {
    Json(state.scanner.list_ports())
}

/// `POST /api/connect`
pub async fn connect(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ConnectRequest>,
) -> ApiResult<Json<Value>> {
    let session = state.manager.connect(request).await?;
    info!(device_id = %session.device_id(), "connected via api");
    Ok(Json(json!({
        "success": true,
        "device_id": session.device_id(),
        "message": format!("Connected to {} on {}", session.family().label(), session.endpoint()),
    })))
}

/// `POST /api/disconnect/:device_id`
pub async fn disconnect(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.disconnect(&device_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Disconnected {device_id}"),
    })))
}

/// `POST /api/command/:device_id` with `{"command": "...", "params": {...}}`
pub async fn command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    ApiJson(command): ApiJson<Command>,
) -> ApiResult<Json<Value>> {
    let outcome = state.manager.execute(&device_id, &command).await?;
    Ok(Json(json!({"success": true, "result": outcome})))
}

/// `GET /api/devices`
pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list_sessions())
}

/// `GET /api/devices/:device_id`
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<DeviceSnapshot>> {
    Ok(Json(state.manager.get_session(&device_id)?.snapshot()))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "devices": state.manager.list_sessions().len(),
    }))
}
