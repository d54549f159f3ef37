//! Ordered plugin execution for one source

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use relay_common::PluginConfig;
use tracing::{debug, error};

use crate::{InboundOutcome, InboundPlugin, InboundRequest, PluginError, PluginRegistry, Result};

#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn InboundPlugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn InboundPlugin>>) -> Self {
        Self { plugins }
    }

    /// Build the enabled plugins in configured order. Fails on the first
    /// plugin that cannot be built.
    pub fn build(registry: &PluginRegistry, configs: &[PluginConfig]) -> Result<Self> {
        let plugins = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| registry.build(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { plugins })
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin in order. Stops at the first termination or error;
    /// a panicking plugin is reported as `PluginError::Panicked`.
    pub async fn run(&self, request: &InboundRequest, mut payload: Bytes) -> Result<InboundOutcome> {
        for plugin in &self.plugins {
            let outcome = AssertUnwindSafe(plugin.execute_inbound(request, payload))
                .catch_unwind()
                .await
                .map_err(|_| {
                    error!(plugin = plugin.name(), path = %request.path, "Plugin panicked");
                    PluginError::Panicked {
                        plugin: plugin.name().to_string(),
                    }
                })??;

            match outcome {
                InboundOutcome::Continue(next) => payload = next,
                InboundOutcome::Terminate(response) => {
                    debug!(
                        plugin = plugin.name(),
                        status = response.status,
                        "Plugin terminated request"
                    );
                    return Ok(InboundOutcome::Terminate(response));
                }
            }
        }
        Ok(InboundOutcome::Continue(payload))
    }
}
