//! Model pricing for completion cost estimates.
//!
//! Prices are in USD per 1 million tokens. Entries are keyed by model-name
//! prefix, so dated snapshots (`claude-sonnet-4-20250514`) resolve to their
//! family (`claude-sonnet`).

use serde::{Deserialize, Serialize};

/// Per-million-token pricing for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost for the given token counts, rounded to 8 decimal places.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let raw = (input_tokens as f64 * self.input_per_m
            + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0;
        (raw * 1e8).round() / 1e8
    }
}

/// Prefix-keyed pricing table.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: Vec<(String, ModelPricing)>,
}

impl PricingTable {
    /// Table with built-in prices for the model families we talk to.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();

        // ── Anthropic ──────────────────────────────────────────────
        table.set("claude-sonnet", ModelPricing::new(3.0, 15.0));
        table.set("claude-haiku", ModelPricing::new(0.8, 4.0));
        table.set("claude-opus", ModelPricing::new(15.0, 75.0));
        table.set("claude-3-haiku", ModelPricing::new(0.25, 1.25));

        // ── OpenAI ─────────────────────────────────────────────────
        table.set("gpt-4o", ModelPricing::new(2.5, 10.0));
        table.set("gpt-4o-mini", ModelPricing::new(0.15, 0.6));

        table
    }

    pub fn empty() -> Self {
        Self { prices: Vec::new() }
    }

    /// Add or replace the pricing for a model prefix.
    pub fn set(&mut self, prefix: impl Into<String>, pricing: ModelPricing) {
        let prefix = prefix.into().to_lowercase();
        match self.prices.iter_mut().find(|(p, _)| *p == prefix) {
            Some(entry) => entry.1 = pricing,
            None => self.prices.push((prefix, pricing)),
        }
    }

    /// Pricing for `model`: the longest matching prefix wins. A provider
    /// prefix such as `anthropic/` is ignored.
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let normalized = model.trim().to_lowercase();
        let bare = normalized.rsplit('/').next().unwrap_or(&normalized);
        if bare.is_empty() {
            return None;
        }
        self.prices
            .iter()
            .filter(|(prefix, _)| bare.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, pricing)| *pricing)
    }

    /// Estimated USD cost of a completion, `None` for unknown models.
    pub fn estimate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> Option<f64> {
        self.get(model).map(|p| p.cost(input_tokens, output_tokens))
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}
