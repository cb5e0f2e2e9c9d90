//! Narrator configuration.
//!
//! Everything that would otherwise be an ambient constant (models, timeouts,
//! budgets, price tables) is carried here and injected into the orchestrator.

use crate::index::DEFAULT_EVENT_INDEX_LIMIT;
use crate::prompt::CallType;
use crate::sticky::DEFAULT_TOKEN_BUDGET;
use crate::window::DEFAULT_WINDOW_SIZE;
use claude::Usage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default model for routing (fast and cheap).
pub const ROUTER_MODEL: &str = "claude-3-5-haiku-20241022";

/// Default model for narrative generation.
pub const GENERATION_MODEL: &str = "claude-sonnet-4-20250514";

/// Maximum routing/broadening cycles per player input.
pub const MAX_ATTEMPTS: u32 = 3;

/// Configuration for a narrator session.
#[derive(Debug, Clone)]
pub struct NarratorConfig {
    /// Model used for router calls.
    pub router_model: String,

    /// Model used for generation calls.
    pub generation_model: String,

    /// Timeout for a single router call.
    pub router_timeout: Duration,

    /// Timeout for a single generation call.
    pub generation_timeout: Duration,

    /// Maximum tokens for a router response.
    pub router_max_tokens: usize,

    /// Temperature for generation.
    pub temperature: Option<f32>,

    /// Maximum attempts per player input.
    pub max_attempts: u32,

    /// Sticky context budget in estimated tokens.
    pub sticky_budget: usize,

    /// Exchanges kept in the conversation window.
    pub window_size: usize,

    /// Events included in the router's event index.
    pub event_index_limit: usize,

    /// Exchanges after which the profile segment is due for a refresh.
    pub profile_refresh_interval: usize,

    /// Call types that go straight to generation without routing.
    pub skip_routing: Vec<CallType>,

    /// Per-model prices used for cost accounting.
    pub pricing: PricingTable,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            router_model: ROUTER_MODEL.to_string(),
            generation_model: GENERATION_MODEL.to_string(),
            router_timeout: Duration::from_secs(20),
            generation_timeout: Duration::from_secs(90),
            router_max_tokens: 600,
            temperature: Some(0.8),
            max_attempts: MAX_ATTEMPTS,
            sticky_budget: DEFAULT_TOKEN_BUDGET,
            window_size: DEFAULT_WINDOW_SIZE,
            event_index_limit: DEFAULT_EVENT_INDEX_LIMIT,
            profile_refresh_interval: 20,
            skip_routing: vec![CallType::RollResult, CallType::SessionOpen],
            pricing: PricingTable::default(),
        }
    }
}

impl NarratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_router_model(mut self, model: impl Into<String>) -> Self {
        self.router_model = model.into();
        self
    }

    pub fn with_generation_model(mut self, model: impl Into<String>) -> Self {
        self.generation_model = model.into();
        self
    }

    pub fn with_timeouts(mut self, router: Duration, generation: Duration) -> Self {
        self.router_timeout = router;
        self.generation_timeout = generation;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_sticky_budget(mut self, budget: usize) -> Self {
        self.sticky_budget = budget;
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_profile_refresh_interval(mut self, exchanges: usize) -> Self {
        self.profile_refresh_interval = exchanges;
        self
    }

    pub fn with_skip_routing(mut self, call_types: Vec<CallType>) -> Self {
        self.skip_routing = call_types;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Whether this call type bypasses the router.
    pub fn skips_routing(&self, call_type: &CallType) -> bool {
        self.skip_routing.contains(call_type)
    }
}

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl ModelPricing {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            cache_write: input * 1.25,
            cache_read: input * 0.1,
        }
    }

    /// Cost of one call in USD.
    pub fn cost(&self, usage: &Usage) -> f64 {
        let per_token = |count: usize, price: f64| count as f64 * price / 1_000_000.0;
        per_token(usage.input_tokens, self.input)
            + per_token(usage.output_tokens, self.output)
            + per_token(usage.cache_creation_input_tokens, self.cache_write)
            + per_token(usage.cache_read_input_tokens, self.cache_read)
    }
}

/// Price table keyed by model name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// An empty table; every call costs zero.
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Cost of one call in USD; zero for models missing from the table.
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        self.get(model).map_or(0.0, |p| p.cost(usage))
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::empty()
            .with_model(ROUTER_MODEL, ModelPricing::new(0.80, 4.0))
            .with_model(GENERATION_MODEL, ModelPricing::new(3.0, 15.0))
    }
}
