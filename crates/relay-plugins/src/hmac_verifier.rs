//! HMAC-SHA256 signature check over the raw request body

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::registry::parse_config;
use crate::{InboundOutcome, InboundPlugin, InboundRequest, PluginError, PluginResponse, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HmacVerifierConfig {
    pub secret: String,
    #[serde(default = "default_header")]
    pub header: String,
    #[serde(default)]
    pub encoding: SignatureEncoding,
    /// Stripped from the header value before decoding, e.g. "sha256="
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_header() -> String {
    "X-Signature".to_string()
}

pub struct HmacVerifier {
    config: HmacVerifierConfig,
}

impl HmacVerifier {
    pub const NAME: &'static str = "hmac-verifier";

    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let config: HmacVerifierConfig = parse_config(Self::NAME, config)?;
        Self::new(config)
    }

    pub fn new(config: HmacVerifierConfig) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(PluginError::config(Self::NAME, "secret must not be empty"));
        }
        if http::HeaderName::from_bytes(config.header.as_bytes()).is_err() {
            return Err(PluginError::config(Self::NAME, format!("invalid header name: {}", config.header)));
        }
        Ok(Self { config })
    }

    pub fn sign(&self, body: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(self.config.secret.as_bytes()) {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }

    pub fn verify(&self, body: &[u8], header_value: &str) -> bool {
        let value = header_value.trim();
        let value = match &self.config.prefix {
            Some(prefix) => match value.strip_prefix(prefix.as_str()) {
                Some(rest) => rest,
                None => return false,
            },
            None => value,
        };

        let provided = match self.config.encoding {
            SignatureEncoding::Hex => hex::decode(value).ok(),
            SignatureEncoding::Base64 => base64::engine::general_purpose::STANDARD.decode(value).ok(),
        };
        let Some(provided) = provided else {
            return false;
        };

        let expected = self.sign(body);
        !expected.is_empty() && expected.ct_eq(&provided).into()
    }
}

#[async_trait]
impl InboundPlugin for HmacVerifier {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute_inbound(&self, request: &InboundRequest, payload: Bytes) -> Result<InboundOutcome> {
        let signature = request
            .headers
            .get(self.config.header.as_str())
            .and_then(|v| v.to_str().ok());

        match signature {
            Some(sig) if self.verify(&payload, sig) => Ok(InboundOutcome::Continue(payload)),
            _ => {
                debug!(header = %self.config.header, path = %request.path, "Signature verification failed");
                Ok(InboundOutcome::Terminate(PluginResponse::json(
                    401,
                    &serde_json::json!({"message": "invalid signature"}),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method};
    use serde_json::json;

    fn request_with(header: &str, value: &str) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::HeaderName::from_bytes(header.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        InboundRequest {
            method: Method::POST,
            path: "/".to_string(),
            query: None,
            headers,
        }
    }

    #[tokio::test]
    async fn test_valid_hex_signature_passes() {
        let plugin = HmacVerifier::from_config(&json!({
            "secret": "topsecret",
            "header": "X-Hub-Signature-256",
            "prefix": "sha256="
        }))
        .unwrap();
        let body = Bytes::from_static(br#"{"event_type":"push","data":{}}"#);
        let signature = format!("sha256={}", hex::encode(plugin.sign(&body)));

        let outcome = plugin
            .execute_inbound(&request_with("X-Hub-Signature-256", &signature), body.clone())
            .await
            .unwrap();
        assert_eq!(outcome, InboundOutcome::Continue(body));
    }

    #[tokio::test]
    async fn test_valid_base64_signature_passes() {
        let plugin = HmacVerifier::from_config(&json!({"secret": "s", "encoding": "base64"})).unwrap();
        let body = Bytes::from_static(b"{}");
        let signature = base64::engine::general_purpose::STANDARD.encode(plugin.sign(&body));

        let outcome = plugin
            .execute_inbound(&request_with("X-Signature", &signature), body)
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Continue(_)));
    }

    #[tokio::test]
    async fn test_tampered_body_is_rejected() {
        let plugin = HmacVerifier::from_config(&json!({"secret": "s"})).unwrap();
        let signature = hex::encode(plugin.sign(b"original"));

        let outcome = plugin
            .execute_inbound(&request_with("X-Signature", &signature), Bytes::from_static(b"tampered"))
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Terminate(r) if r.status == 401));
    }

    #[tokio::test]
    async fn test_missing_header_is_rejected() {
        let plugin = HmacVerifier::from_config(&json!({"secret": "s"})).unwrap();
        let outcome = plugin
            .execute_inbound(&request_with("X-Other", "abc"), Bytes::new())
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Terminate(r) if r.status == 401));
    }

    #[test]
    fn test_wrong_prefix_or_encoding_fails() {
        let plugin = HmacVerifier::from_config(&json!({"secret": "s", "prefix": "sha256="})).unwrap();
        let sig = hex::encode(plugin.sign(b"body"));
        assert!(!plugin.verify(b"body", &sig));
        assert!(!plugin.verify(b"body", "sha256=zz-not-hex"));
        assert!(plugin.verify(b"body", &format!("sha256={}", sig)));
    }

    #[test]
    fn test_config_validation() {
        assert!(HmacVerifier::from_config(&json!({"secret": ""})).is_err());
        assert!(HmacVerifier::from_config(&json!({"secret": "s", "header": "bad header"})).is_err());
        assert!(HmacVerifier::from_config(&json!({"secret": "s", "encoding": "rot13"})).is_err());
    }
}
