//! Inbound HTTP admission
//!
//! Every path is served by a single fallback handler: the route table
//! decides whether a request belongs to a source, so nothing is registered
//! with axum per source.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use relay_common::{Event, ResponseOverride};
use relay_config::ProxyConfig;
use relay_dispatcher::Dispatcher;
use relay_plugins::{InboundOutcome, InboundRequest, PluginResponse};
use serde_json::{json, Map, Value};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::GatewayError;
use crate::router::{Route, Router};
use crate::staging::Stager;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_request_body_size: usize,
    /// Answer for admitted events when the source has no override
    pub default_response: ResponseOverride,
}

impl From<&ProxyConfig> for GatewayConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_request_body_size: config.max_request_body_size,
            default_response: config.response.clone(),
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
    stager: Option<Stager>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, router: Arc<Router>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            router,
            dispatcher,
            stager: None,
        }
    }

    /// Enable background dispatch for sources with `async_ingest`.
    /// Without a stager those sources are dispatched inline.
    pub fn with_stager(mut self, stager: Stager) -> Self {
        self.stager = Some(stager);
        self
    }

    pub fn into_router(self) -> axum::Router {
        axum::Router::new()
            .fallback(handle_inbound)
            .with_state(Arc::new(self))
            .layer(TraceLayer::new_for_http())
    }

    async fn admit(&self, request: Request) -> Result<(Response, &'static str), GatewayError> {
        let method = request.method().as_str().to_string();
        let path = request.uri().path().to_string();
        let route = self.router.route(&method, &path).ok_or(GatewayError::RoutingMiss)?;

        let limit = self.config.max_request_body_size;
        let declared = request
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(GatewayError::PayloadTooLarge { limit });
        }

        let (parts, body) = request.into_parts();
        let payload = read_body(body, limit).await?;

        let inbound = InboundRequest {
            method: parts.method,
            path,
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
        };
        let payload = match route.plugins.run(&inbound, payload).await? {
            InboundOutcome::Continue(payload) => payload,
            InboundOutcome::Terminate(response) => {
                return Ok((plugin_response(response), "plugin_terminated"));
            }
        };

        let event = parse_event(&route.source.workspace_id, &payload)?;
        let outcome = self.accept(route.clone(), event).await?;

        let response = route.source.response.as_ref().unwrap_or(&self.config.default_response);
        Ok((override_response(response), outcome))
    }

    async fn accept(&self, route: Arc<Route>, event: Event) -> Result<&'static str, GatewayError> {
        if route.source.async_ingest {
            if let Some(stager) = &self.stager {
                debug!(event_id = %event.id, source_id = %route.source.id, "Event staged");
                stager.stage(route, event)?;
                return Ok("staged");
            }
        }
        self.dispatcher.dispatch(&route.source, &event).await?;
        Ok("accepted")
    }
}

async fn handle_inbound(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    match gateway.admit(request).await {
        Ok((response, outcome)) => {
            metrics::counter!("relay_inbound_requests_total", "outcome" => outcome).increment(1);
            response
        }
        Err(e) => {
            metrics::counter!("relay_inbound_requests_total", "outcome" => e.outcome()).increment(1);
            debug!(error = %e, "Inbound request rejected");
            e.into_response()
        }
    }
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, GatewayError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(GatewayError::PayloadTooLarge { limit }),
        Err(e) => Err(GatewayError::BodyRead(e.to_string())),
    }
}

/// Build an event from `{"event_type": ..., "data": ...}`
fn parse_event(workspace_id: &str, payload: &[u8]) -> Result<Event, GatewayError> {
    let document: Value =
        serde_json::from_slice(payload).map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let Value::Object(mut object) = document else {
        return Err(GatewayError::MalformedPayload("payload must be a JSON object".to_string()));
    };

    let mut fields = Map::new();
    let event_type = match object.remove("event_type") {
        Some(Value::String(t)) if !t.trim().is_empty() => Some(t),
        Some(Value::String(_)) | Some(Value::Null) | None => {
            fields.insert("event_type".to_string(), json!("is required"));
            None
        }
        Some(_) => {
            fields.insert("event_type".to_string(), json!("must be a string"));
            None
        }
    };
    let data = match object.remove("data") {
        Some(Value::Null) | None => {
            fields.insert("data".to_string(), json!("is required"));
            None
        }
        Some(data) => Some(data),
    };

    match (event_type, data) {
        (Some(event_type), Some(data)) => Ok(Event::new(workspace_id, event_type, data)),
        _ => Err(GatewayError::PayloadInvalid(fields)),
    }
}

fn override_response(response: &ResponseOverride) -> Response {
    let status = StatusCode::from_u16(response.code).unwrap_or(StatusCode::OK);
    (
        status,
        [(CONTENT_TYPE, response.content_type.clone())],
        response.body.clone(),
    )
        .into_response()
}

fn plugin_response(response: PluginResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_REQUEST);
    let mut out = (status, response.body).into_response();
    for (name, value) in response.headers {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            out.headers_mut().insert(name, value);
        }
    }
    out
}
