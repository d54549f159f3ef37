//! Inbound plugin pipeline
//!
//! Plugins run on the raw request body before an event is admitted. Each
//! one may pass the payload on (possibly rewritten), or terminate the
//! request with its own response.
//!
//! - `PluginRegistry`: builds plugins by name from their typed config
//! - `PluginChain`: ordered, short-circuiting, panic-safe execution
//! - Built-ins: `jsonschema-validator`, `hmac-verifier`, `payload-transform`

pub mod chain;
pub mod hmac_verifier;
pub mod jsonschema_validator;
pub mod payload_transform;
pub mod registry;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;

pub use chain::PluginChain;
pub use registry::PluginRegistry;

#[derive(Error, Debug, Clone)]
pub enum PluginError {
    #[error("unknown plugin: {0}")]
    Unknown(String),

    #[error("invalid config for plugin {plugin}: {message}")]
    Config { plugin: String, message: String },

    /// The payload cannot be processed by the plugin
    #[error("plugin {plugin} rejected payload: {message}")]
    BadPayload { plugin: String, message: String },

    #[error("plugin {plugin} failed: {message}")]
    Execution { plugin: String, message: String },

    #[error("plugin {plugin} panicked")]
    Panicked { plugin: String },
}

impl PluginError {
    pub fn config(plugin: &str, message: impl Into<String>) -> Self {
        Self::Config {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    pub fn bad_payload(plugin: &str, message: impl Into<String>) -> Self {
        Self::BadPayload {
            plugin: plugin.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status the request path answers with
    pub fn status(&self) -> u16 {
        match self {
            PluginError::BadPayload { .. } => 400,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// HTTP context of the inbound request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
}

/// Response written by a plugin that terminates the request
#[derive(Debug, Clone, PartialEq)]
pub struct PluginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PluginResponse {
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Hand the (possibly rewritten) payload to the next plugin
    Continue(Bytes),
    /// Stop processing and answer with this response
    Terminate(PluginResponse),
}

#[async_trait]
pub trait InboundPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn execute_inbound(&self, request: &InboundRequest, payload: Bytes) -> Result<InboundOutcome>;
}

/// Standard body for a failed validation
pub fn validation_failure(error: serde_json::Value) -> PluginResponse {
    PluginResponse::json(
        400,
        &serde_json::json!({
            "message": "Request Validation",
            "error": error,
        }),
    )
}
