//! Maps [`PipecraftError`] onto the `{kind, message, occurredAt}` error
//! body every command verb returns on failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use pipecraft_core::PipecraftError;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(rename = "occurredAt")]
    occurred_at: chrono::DateTime<Utc>,
}

/// Wraps a [`PipecraftError`] so handlers can return it directly from a
/// `Result` and have axum turn it into the right status code and body.
pub struct GatewayError(pub PipecraftError);

impl From<PipecraftError> for GatewayError {
    fn from(err: PipecraftError) -> Self {
        Self(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            PipecraftError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation"),
            PipecraftError::ConflictState(_) => (StatusCode::CONFLICT, "ConflictState"),
            PipecraftError::Storage(_) | PipecraftError::Io(_) | PipecraftError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage")
            }
            PipecraftError::WorkerCrash(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WorkerCrash"),
            PipecraftError::BridgeLost(_) => (StatusCode::INTERNAL_SERVER_ERROR, "BridgeLost"),
            PipecraftError::Cancellation => (StatusCode::INTERNAL_SERVER_ERROR, "Cancellation"),
            PipecraftError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "WorkerCrash"),
        };
        let body = ErrorBody { kind, message: self.0.to_string(), occurred_at: Utc::now() };
        (status, Json(body)).into_response()
    }
}
