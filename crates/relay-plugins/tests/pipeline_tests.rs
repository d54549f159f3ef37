//! Pipeline tests over the built-in plugins
//!
//! Tests for:
//! - Building chains from source plugin configs
//! - Transform output feeding later plugins
//! - Signature verification before schema validation

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use serde_json::{json, Value};

use relay_common::PluginConfig;
use relay_plugins::hmac_verifier::HmacVerifier;
use relay_plugins::{InboundOutcome, InboundRequest, PluginChain, PluginError, PluginRegistry};

fn request(headers: HeaderMap) -> InboundRequest {
    InboundRequest {
        method: Method::POST,
        path: "/hooks/x".to_string(),
        query: None,
        headers,
    }
}

fn schema_plugin() -> PluginConfig {
    PluginConfig::new(
        "jsonschema-validator",
        json!({
            "schemas": {
                "foo.bar": {
                    "schema": {
                        "type": "object",
                        "properties": {"key": {"type": "string"}},
                        "required": ["key"]
                    }
                }
            }
        }),
    )
}

#[tokio::test]
async fn test_transform_output_is_validated() {
    let registry = PluginRegistry::with_builtins();
    let chain = PluginChain::build(
        &registry,
        &[
            PluginConfig::new("payload-transform", json!({"set": {"/data/key": "filled"}})),
            schema_plugin(),
        ],
    )
    .unwrap();

    let body = json!({"event_type": "foo.bar", "data": {}}).to_string();
    let outcome = chain.run(&request(HeaderMap::new()), Bytes::from(body)).await.unwrap();

    let InboundOutcome::Continue(payload) = outcome else {
        panic!("expected payload to pass");
    };
    let payload: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(payload["data"]["key"], "filled");
}

#[tokio::test]
async fn test_signature_checked_before_schema() {
    let registry = PluginRegistry::with_builtins();
    let hmac_config = json!({"secret": "s3cr3t", "header": "X-Signature"});
    let chain = PluginChain::build(
        &registry,
        &[PluginConfig::new("hmac-verifier", hmac_config.clone()), schema_plugin()],
    )
    .unwrap();

    let body = Bytes::from(json!({"event_type": "foo.bar", "data": {"key": 123}}).to_string());

    // unsigned request never reaches the validator
    let outcome = chain.run(&request(HeaderMap::new()), body.clone()).await.unwrap();
    assert!(matches!(outcome, InboundOutcome::Terminate(r) if r.status == 401));

    // signed request is judged by the validator
    let signer = HmacVerifier::from_config(&hmac_config).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-signature",
        HeaderValue::from_str(&hex::encode(signer.sign(&body))).unwrap(),
    );
    let outcome = chain.run(&request(headers), body).await.unwrap();
    assert!(matches!(outcome, InboundOutcome::Terminate(r) if r.status == 400));
}

#[test]
fn test_chain_build_fails_on_bad_plugin() {
    let registry = PluginRegistry::with_builtins();
    let result = PluginChain::build(
        &registry,
        &[schema_plugin(), PluginConfig::new("no-such-plugin", Value::Null)],
    );
    assert!(matches!(result, Err(PluginError::Unknown(_))));
}
