//! JSON Schema validation of event data
//!
//! Config:
//! ```json
//! {
//!   "default_schema": { "type": "object" },
//!   "schemas": {
//!     "charge.succeeded": { "schema": { "type": "object", "required": ["id"] } },
//!     "charge.refunded": {}
//!   }
//! }
//! ```
//! Only event types listed under `schemas` are checked. An entry without a
//! schema falls back to `default_schema`. Schemas may be given inline or as
//! a JSON string. Requests without `event_type` or `data`, or whose body is
//! not JSON, are passed through untouched for the gateway to judge.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use jsonschema::Validator;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::registry::parse_config;
use crate::{validation_failure, InboundOutcome, InboundPlugin, InboundRequest, PluginError, Result};

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct JsonSchemaValidatorConfig {
    #[serde(default)]
    pub default_schema: Option<Value>,
    #[serde(default)]
    pub schemas: HashMap<String, SchemaResource>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SchemaResource {
    #[serde(default)]
    pub schema: Option<Value>,
}

pub struct JsonSchemaValidator {
    validators: HashMap<String, Validator>,
}

impl JsonSchemaValidator {
    pub const NAME: &'static str = "jsonschema-validator";

    pub fn from_config(config: &Value) -> Result<Self> {
        let config: JsonSchemaValidatorConfig = parse_config(Self::NAME, config)?;
        Self::new(config)
    }

    pub fn new(config: JsonSchemaValidatorConfig) -> Result<Self> {
        let default_schema = config
            .default_schema
            .map(|s| schema_document("default_schema", s))
            .transpose()?;

        let mut validators = HashMap::new();
        for (event_type, resource) in config.schemas {
            let field = format!("schemas[{}]", event_type);
            let schema = match resource.schema {
                Some(schema) if !is_empty_schema(&schema) => schema_document(&field, schema)?,
                _ => default_schema
                    .clone()
                    .ok_or_else(|| PluginError::config(Self::NAME, format!("{}: no schema and no default_schema", field)))?,
            };
            let validator = jsonschema::validator_for(&schema)
                .map_err(|e| PluginError::config(Self::NAME, format!("{}: {}", field, e)))?;
            validators.insert(event_type, validator);
        }

        Ok(Self { validators })
    }

    /// Validate `data` against the schema for `event_type`, if any.
    /// Returns the failing fields keyed by their location.
    pub fn check(&self, event_type: &str, data: &Value) -> Option<Map<String, Value>> {
        let validator = self.validators.get(event_type)?;
        let mut fields = Map::new();
        for error in validator.iter_errors(data) {
            fields
                .entry(field_name(&error.instance_path.to_string()))
                .or_insert_with(|| Value::String(error.to_string()));
        }
        (!fields.is_empty()).then_some(fields)
    }
}

fn is_empty_schema(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Accept a schema as a JSON value or as a string holding JSON
fn schema_document(field: &str, schema: Value) -> Result<Value> {
    match schema {
        Value::String(raw) => serde_json::from_str(&raw).map_err(|_| {
            PluginError::config(JsonSchemaValidator::NAME, format!("{}: value must be a valid jsonschema", field))
        }),
        other => Ok(other),
    }
}

/// "/items/0/id" -> "data.items.0.id"
fn field_name(pointer: &str) -> String {
    let mut name = String::from("data");
    for token in pointer.split('/').skip(1) {
        name.push('.');
        name.push_str(&token.replace("~1", "/").replace("~0", "~"));
    }
    name
}

#[async_trait]
impl InboundPlugin for JsonSchemaValidator {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute_inbound(&self, _request: &InboundRequest, payload: Bytes) -> Result<InboundOutcome> {
        let event: Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(_) => return Ok(InboundOutcome::Continue(payload)),
        };

        let event_type = match event.get("event_type").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t,
            _ => return Ok(InboundOutcome::Continue(payload)),
        };
        let data = match event.get("data") {
            Some(d) if !d.is_null() => d,
            _ => return Ok(InboundOutcome::Continue(payload)),
        };

        match self.check(event_type, data) {
            Some(fields) => {
                debug!(event_type, failures = fields.len(), "Event data failed schema validation");
                Ok(InboundOutcome::Terminate(validation_failure(json!({
                    "message": "request validation",
                    "fields": fields,
                }))))
            }
            None => Ok(InboundOutcome::Continue(payload)),
        }
    }
}
