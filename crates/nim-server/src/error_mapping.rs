//! Semantic mapping from `NimError` to HTTP responses.
//!
//! Every handler returns [`ApiError`] on failure, so the status table lives in one place:
//!
//! | Error                              | Status                      |
//! |------------------------------------|-----------------------------|
//! | `Validation`, `UnknownCommand`     | 400 Bad Request             |
//! | `NotFound`                         | 404 Not Found               |
//! | `AlreadyConnected`, `Cancelled`    | 409 Conflict                |
//! | `Protocol`                         | 502 Bad Gateway             |
//! | `Transport`                        | 503 Service Unavailable     |
//! | `Timeout`                          | 504 Gateway Timeout         |
//! | `Configuration`                    | 500 Internal Server Error   |
//!
//! The body is always `{"success": false, "error": "<message>"}`. Validation messages are
//! passed through verbatim so the control panel can show them next to the input. A body
//! that is not valid JSON for the route is a `Validation` error too.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nim_core::NimError;
use serde_json::json;

/// HTTP status for an error.
pub fn status_for(err: &NimError) -> StatusCode {
    match err {
        // Rejected before any I/O; the client must change the request
        NimError::Validation(_) | NimError::UnknownCommand(_) => StatusCode::BAD_REQUEST,

        NimError::NotFound(_) => StatusCode::NOT_FOUND,

        // Registry or session state conflicts with the request
        NimError::AlreadyConnected(_) | NimError::Cancelled(_) => StatusCode::CONFLICT,

        // The device answered, but not in the expected shape
        NimError::Protocol(_) => StatusCode::BAD_GATEWAY,

        // The device is gone; the session has been torn down
        NimError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,

        NimError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,

        NimError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error returned by every gateway handler.
#[derive(Debug)]
pub struct ApiError(pub NimError);

impl From<NimError> for ApiError {
    fn from(err: NimError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(NimError::Validation(format!(
            "invalid request body: {}",
            rejection.body_text()
        )))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, %status, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        let body = Json(json!({"success": false, "error": self.0.to_string()}));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn client_errors() {
        assert_eq!(
            status_for(&NimError::out_of_range("value", 0, 255)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&NimError::UnknownCommand("frobnicate".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&NimError::NotFound("COM3".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&NimError::AlreadyConnected("COM3".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&NimError::Cancelled("COM3 is disconnecting".into())),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn device_errors() {
        assert_eq!(status_for(&NimError::Protocol("echo".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&NimError::Transport("gone".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&NimError::Timeout(Duration::from_secs(1))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(&NimError::Configuration("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn body_carries_verbatim_message() {
        let response = ApiError(NimError::out_of_range("value", 0, 255)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"success": false, "error": "value out of range 0-255"}));
    }
}
