//! Per-model pricing used to estimate generation cost.
//!
//! Backends that report a cost directly win. When only token counts are
//! known the cost is estimated from the pricing table; when neither is
//! known the cost stays `None` and the run summary counts the task as
//! having unknown cost.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Prices in dollars per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPricing {
    pub fn new(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
        }
    }

    /// Estimated cost in dollars.
    pub fn estimate(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Resolves the cost of one call.
    ///
    /// A reported cost is used as-is. Otherwise both token counts and a
    /// price entry are needed; any gap yields `None`.
    pub fn resolve(
        &self,
        model: &str,
        reported: Option<f64>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    ) -> Option<f64> {
        if reported.is_some() {
            return reported;
        }
        let pricing = self.get(model)?;
        Some(pricing.estimate(input_tokens?, output_tokens?))
    }
}
