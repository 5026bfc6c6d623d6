//! Shared application state for the agent service.

use std::sync::Arc;

use serde::Serialize;

use forgeline::io::config::{BreakerConfig, GeneratorConfig};
use forgeline::runtime::AgentInvoker;
use forgeline::runtime::breaker::{BreakerStore, InMemoryBreakerStore};

/// Generator settings reported by `/health`. Never carries the key itself.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GeneratorInfo {
    pub configured: bool,
    pub model: String,
    pub base_url: String,
}

impl GeneratorInfo {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            configured: config.api_key().is_some(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        }
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runs one invocation to completion; called on a blocking worker.
    pub invoker: Arc<dyn AgentInvoker>,
    pub generator: GeneratorInfo,
    /// The same counters the invoker's runtime trips.
    pub breakers: Arc<dyn BreakerStore>,
    pub breaker_threshold: u32,
}

impl AppState {
    pub fn new(invoker: Arc<dyn AgentInvoker>, generator: GeneratorInfo) -> Self {
        Self {
            invoker,
            generator,
            breakers: Arc::new(InMemoryBreakerStore::new()),
            breaker_threshold: BreakerConfig::default().threshold,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<dyn BreakerStore>, threshold: u32) -> Self {
        self.breakers = breakers;
        self.breaker_threshold = threshold;
        self
    }
}
