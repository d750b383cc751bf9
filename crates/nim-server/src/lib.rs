//! HTTP and WebSocket gateway.
//!
//! Thin translation layer between JSON requests and the [`SessionManager`]. Handlers are
//! family-agnostic: the driver selected at connect time decides what a command means.
//!
//! # Routes
//!
//! | Method | Path                           | Handler                  |
//! |--------|--------------------------------|--------------------------|
//! | GET    | `/api/ports`                   | [`api::list_ports`]      |
//! | POST   | `/api/connect`                 | [`api::connect`]         |
//! | POST   | `/api/disconnect/:device_id`   | [`api::disconnect`]      |
//! | POST   | `/api/command/:device_id`      | [`api::command`]         |
//! | GET    | `/api/devices`                 | [`api::list_devices`]    |
//! | GET    | `/api/devices/:device_id`      | [`api::get_device`]      |
//! | GET    | `/health`                      | [`api::health`]          |
//! | GET    | `/ws`                          | [`ws::ws_handler`]       |

pub mod api;
pub mod error_mapping;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use nim_session::{PortScanner, SessionManager};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error_mapping::{status_for, ApiError};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Session registry.
    pub manager: Arc<SessionManager>,
    /// Source of the port list.
    pub scanner: Arc<dyn PortScanner>,
}

impl AppState {
    /// Bundle a manager with a port scanner.
    pub fn new(manager: Arc<SessionManager>, scanner: Arc<dyn PortScanner>) -> Self {
        Self { manager, scanner }
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ports", get(api::list_ports))
        .route("/connect", post(api::connect))
        .route("/disconnect/:device_id", post(api::disconnect))
        .route("/command/:device_id", post(api::command))
        .route("/devices", get(api::list_devices))
        .route("/devices/:device_id", get(api::get_device));

    Router::new()
        .nest("/api", api)
        .route("/health", get(api::health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        // the control panel may be served from another origin
        .layer(CorsLayer::permissive())
        .with_state(state)
}
