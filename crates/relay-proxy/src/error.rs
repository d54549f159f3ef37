//! Request-path errors and their HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_dispatcher::DispatchError;
use relay_plugins::PluginError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no source matches the request")]
    RoutingMiss,

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("failed to read request body: {0}")]
    BodyRead(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Well-formed JSON missing required fields; values are per-field messages
    #[error("request validation failed")]
    PayloadInvalid(serde_json::Map<String, serde_json::Value>),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("staging buffer is full")]
    StagingFull,
}

impl GatewayError {
    /// Label used for the inbound request counter
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::RoutingMiss => "not_found",
            GatewayError::PayloadTooLarge { .. } => "too_large",
            GatewayError::BodyRead(_) | GatewayError::MalformedPayload(_) | GatewayError::PayloadInvalid(_) => {
                "invalid"
            }
            GatewayError::Plugin(e) if e.status() < 500 => "plugin_rejected",
            GatewayError::Plugin(_) => "plugin_fault",
            GatewayError::Dispatch(_) => "dispatch_failed",
            GatewayError::StagingFull => "staging_full",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatewayError::RoutingMiss => (StatusCode::NOT_FOUND, json!({"message": "not found"})),
            GatewayError::PayloadTooLarge { .. } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({"message": "Request Entity Too Large"}),
            ),
            GatewayError::BodyRead(msg) | GatewayError::MalformedPayload(msg) => {
                (StatusCode::BAD_REQUEST, json!({"message": msg}))
            }
            GatewayError::PayloadInvalid(fields) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "message": "Request Validation",
                    "error": {"message": "request validation", "fields": fields},
                }),
            ),
            GatewayError::Plugin(e) if e.status() < 500 => (
                StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST),
                json!({"message": e.to_string()}),
            ),
            GatewayError::Plugin(e) => {
                error!(error = %e, "Plugin fault");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({"message": "internal error"}))
            }
            GatewayError::Dispatch(_) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"message": "internal error"})),
            GatewayError::StagingFull => (StatusCode::SERVICE_UNAVAILABLE, json!({"message": "service unavailable"})),
        };
        (status, Json(body)).into_response()
    }
}
