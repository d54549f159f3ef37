//! Endpoint delivery over HTTP

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relay_common::{AttemptRequest, AttemptResponse, AttemptStatus, Endpoint, Event};
use tracing::debug;

use crate::{DeliveryError, Result};

/// Recorded response bodies are cut to this many bytes
pub const MAX_RESPONSE_BODY: usize = 4 * 1024;

pub const EVENT_ID_HEADER: &str = "x-relay-event-id";
pub const EVENT_TYPE_HEADER: &str = "x-relay-event-type";

/// Result of one delivery try, ready to be recorded as an attempt
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub status: AttemptStatus,
    pub status_code: Option<u16>,
    pub request: AttemptRequest,
    pub response: Option<AttemptResponse>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl DeliveryOutcome {
    pub fn errored(request: AttemptRequest, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: AttemptStatus::Errored,
            status_code: None,
            request,
            response: None,
            error: Some(error.into()),
            duration,
        }
    }
}

#[async_trait]
pub trait Deliverer: Send + Sync {
    /// Send `event` to `endpoint`. Never fails: transport problems are
    /// reported as an `Errored` outcome.
    async fn deliver(&self, endpoint: &Endpoint, event: &Event, timeout: Duration) -> DeliveryOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpDelivererConfig {
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpDelivererConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            user_agent: concat!("relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Sends the event's `data` as a JSON body
pub struct HttpDeliverer {
    client: reqwest::Client,
}

impl HttpDeliverer {
    pub fn new(config: HttpDelivererConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(DeliveryError::Client)?;
        Ok(Self { client })
    }

    fn request_headers(endpoint: &Endpoint, event: &Event) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        for (name, value) in &endpoint.headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        headers.insert(EVENT_ID_HEADER.to_string(), event.id.to_string());
        headers.insert(EVENT_TYPE_HEADER.to_string(), event.event_type.clone());
        headers
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, endpoint: &Endpoint, event: &Event, timeout: Duration) -> DeliveryOutcome {
        let started = Instant::now();
        let method = endpoint.method.to_ascii_uppercase();
        let headers = Self::request_headers(endpoint, event);
        let record = AttemptRequest {
            method: method.clone(),
            url: endpoint.url.clone(),
            headers: headers.clone(),
        };

        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return DeliveryOutcome::errored(record, format!("invalid method: {}", method), started.elapsed()),
        };
        let body = match serde_json::to_vec(&event.data) {
            Ok(b) => b,
            Err(e) => return DeliveryOutcome::errored(record, format!("failed to encode payload: {}", e), started.elapsed()),
        };

        let mut request = self.client.request(method, &endpoint.url).timeout(timeout).body(body);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("request timed out after {}ms", timeout.as_millis())
                } else {
                    e.to_string()
                };
                debug!(endpoint_id = %endpoint.id, error = %error, "Delivery errored");
                return DeliveryOutcome::errored(record, error, started.elapsed());
            }
        };

        let status_code = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let mut body = Vec::new();
        let mut read_error = None;
        while body.len() < MAX_RESPONSE_BODY {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    read_error = Some(format!("failed to read response body: {}", e));
                    break;
                }
            }
        }
        body.truncate(MAX_RESPONSE_BODY);

        let status = if response.status().is_success() {
            AttemptStatus::Succeeded
        } else {
            AttemptStatus::Failed
        };

        DeliveryOutcome {
            status,
            status_code: Some(status_code),
            request: record,
            response: Some(AttemptResponse {
                status_code,
                headers: response_headers,
                body: (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned()),
            }),
            error: read_error,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn deliverer() -> HttpDeliverer {
        HttpDeliverer::new(HttpDelivererConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_sends_data_with_relay_headers() {
        let server = MockServer::start().await;
        let event = Event::new("ws", "order.created", json!({"order": 42}));

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-relay-event-id", event.id.to_string().as_str()))
            .and(header("x-relay-event-type", "order.created"))
            .and(header("authorization", "Bearer abc"))
            .and(body_json(json!({"order": 42})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = Endpoint::new("ws", format!("{}/hook", server.uri())).with_header("Authorization", "Bearer abc");
        let outcome = deliverer().deliver(&endpoint, &event, Duration::from_secs(5)).await;

        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert_eq!(outcome.status_code, Some(204));
        assert_eq!(outcome.request.headers["authorization"], "Bearer abc");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_non_success_status_is_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let endpoint = Endpoint::new("ws", server.uri());
        let event = Event::new("ws", "t", json!({}));
        let outcome = deliverer().deliver(&endpoint, &event, Duration::from_secs(5)).await;

        assert_eq!(outcome.status, AttemptStatus::Failed);
        assert_eq!(outcome.status_code, Some(503));
        assert_eq!(outcome.response.unwrap().body.as_deref(), Some("down"));
    }

    #[tokio::test]
    async fn test_response_body_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(MAX_RESPONSE_BODY * 3)))
            .mount(&server)
            .await;

        let endpoint = Endpoint::new("ws", server.uri());
        let outcome = deliverer()
            .deliver(&endpoint, &Event::new("ws", "t", json!({})), Duration::from_secs(5))
            .await;

        assert_eq!(outcome.response.unwrap().body.unwrap().len(), MAX_RESPONSE_BODY);
    }

    #[tokio::test]
    async fn test_timeout_is_errored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let endpoint = Endpoint::new("ws", server.uri());
        let outcome = deliverer()
            .deliver(&endpoint, &Event::new("ws", "t", json!({})), Duration::from_millis(50))
            .await;

        assert_eq!(outcome.status, AttemptStatus::Errored);
        assert!(outcome.status_code.is_none());
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unreachable_is_errored() {
        let endpoint = Endpoint::new("ws", "http://127.0.0.1:1/hook");
        let outcome = deliverer()
            .deliver(&endpoint, &Event::new("ws", "t", json!({})), Duration::from_secs(2))
            .await;

        assert_eq!(outcome.status, AttemptStatus::Errored);
        assert!(outcome.response.is_none());
    }
}
