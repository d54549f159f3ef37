//! Plugin registry keyed by plugin name

use std::collections::HashMap;
use std::sync::Arc;

use relay_common::PluginConfig;

use crate::hmac_verifier::HmacVerifier;
use crate::jsonschema_validator::JsonSchemaValidator;
use crate::payload_transform::PayloadTransform;
use crate::{InboundPlugin, PluginError, Result};

/// Builds a plugin from its raw config, validating it
pub type PluginFactory = Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn InboundPlugin>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in plugin
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(JsonSchemaValidator::NAME, |config| {
            Ok(Arc::new(JsonSchemaValidator::from_config(config)?) as Arc<dyn InboundPlugin>)
        });
        registry.register(HmacVerifier::NAME, |config| {
            Ok(Arc::new(HmacVerifier::from_config(config)?) as Arc<dyn InboundPlugin>)
        });
        registry.register(PayloadTransform::NAME, |config| {
            Ok(Arc::new(PayloadTransform::from_config(config)?) as Arc<dyn InboundPlugin>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn InboundPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, config: &PluginConfig) -> Result<Arc<dyn InboundPlugin>> {
        let factory = self
            .factories
            .get(&config.name)
            .ok_or_else(|| PluginError::Unknown(config.name.clone()))?;
        factory(&config.config)
    }
}

/// Deserialize a typed plugin config, treating null as an empty object
pub(crate) fn parse_config<T: serde::de::DeserializeOwned>(plugin: &str, config: &serde_json::Value) -> Result<T> {
    let value = if config.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(value).map_err(|e| PluginError::config(plugin, e.to_string()))
}
