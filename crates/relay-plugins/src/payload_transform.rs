//! Rewrites the JSON payload using JSON pointers (RFC 6901)
//!
//! Removals are applied before assignments. Missing intermediate objects
//! are created on assignment; removing a missing location is a no-op.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::registry::parse_config;
use crate::{InboundOutcome, InboundPlugin, InboundRequest, PluginError, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PayloadTransformConfig {
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub remove: Vec<String>,
}

pub struct PayloadTransform {
    set: Vec<(Vec<String>, Value)>,
    remove: Vec<Vec<String>>,
}

impl PayloadTransform {
    pub const NAME: &'static str = "payload-transform";

    pub fn from_config(config: &Value) -> Result<Self> {
        let config: PayloadTransformConfig = parse_config(Self::NAME, config)?;
        Self::new(config)
    }

    pub fn new(config: PayloadTransformConfig) -> Result<Self> {
        let set = config
            .set
            .into_iter()
            .map(|(pointer, value)| Ok((parse_pointer(&pointer)?, value)))
            .collect::<Result<Vec<_>>>()?;
        let remove = config
            .remove
            .iter()
            .map(|pointer| parse_pointer(pointer))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { set, remove })
    }

    pub fn apply(&self, mut document: Value) -> Result<Value> {
        for tokens in &self.remove {
            remove_at(&mut document, tokens);
        }
        for (tokens, value) in &self.set {
            set_at(&mut document, tokens, value.clone())?;
        }
        Ok(document)
    }
}

fn parse_pointer(pointer: &str) -> Result<Vec<String>> {
    if pointer.is_empty() {
        return Err(PluginError::config(PayloadTransform::NAME, "pointer must not target the whole document"));
    }
    if !pointer.starts_with('/') {
        return Err(PluginError::config(
            PayloadTransform::NAME,
            format!("pointer must start with '/': {}", pointer),
        ));
    }
    Ok(pointer
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn remove_at(document: &mut Value, tokens: &[String]) {
    let Some((last, parents)) = tokens.split_last() else {
        return;
    };
    let mut node = document;
    for token in parents {
        node = match node {
            Value::Object(map) => match map.get_mut(token) {
                Some(next) => next,
                None => return,
            },
            Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return,
            },
            _ => return,
        };
    }
    match node {
        Value::Object(map) => {
            map.remove(last);
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
}

fn set_at(document: &mut Value, tokens: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = tokens.split_last() else {
        return Ok(());
    };
    let mut node = document;
    for token in parents {
        node = match node {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => {
                let index = array_index(token, items.len())?;
                items
                    .get_mut(index)
                    .ok_or_else(|| bad_path(token))?
            }
            _ => return Err(bad_path(token)),
        };
    }
    match node {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
            } else {
                let len = items.len();
                let index = array_index(last, len)?;
                match items.get_mut(index) {
                    Some(slot) => *slot = value,
                    None if index == len => items.push(value),
                    None => return Err(bad_path(last)),
                }
            }
        }
        _ => return Err(bad_path(last)),
    }
    Ok(())
}

fn array_index(token: &str, len: usize) -> Result<usize> {
    token
        .parse::<usize>()
        .map_err(|_| PluginError::bad_payload(PayloadTransform::NAME, format!("'{}' is not an array index (len {})", token, len)))
}

fn bad_path(token: &str) -> PluginError {
    PluginError::bad_payload(PayloadTransform::NAME, format!("cannot descend into '{}'", token))
}

#[async_trait]
impl InboundPlugin for PayloadTransform {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute_inbound(&self, _request: &InboundRequest, payload: Bytes) -> Result<InboundOutcome> {
        if self.set.is_empty() && self.remove.is_empty() {
            return Ok(InboundOutcome::Continue(payload));
        }
        let document: Value = serde_json::from_slice(&payload)
            .map_err(|e| PluginError::bad_payload(Self::NAME, format!("body is not JSON: {}", e)))?;
        let transformed = self.apply(document)?;
        let body = serde_json::to_vec(&transformed).map_err(|e| PluginError::Execution {
            plugin: Self::NAME.to_string(),
            message: e.to_string(),
        })?;
        Ok(InboundOutcome::Continue(Bytes::from(body)))
    }
}
