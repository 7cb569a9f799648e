use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::TokenUsage;

/// Per-million-token rates for one model, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrice {
    pub const FREE: ModelPrice = ModelPrice {
        input_per_million: 0.0,
        output_per_million: 0.0,
    };

    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }
}

/// Static model → rate table. Unknown models price at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut prices = HashMap::new();
        prices.insert("gpt-4o-mini".to_string(), ModelPrice::new(0.15, 0.60));
        prices.insert("gpt-4o".to_string(), ModelPrice::new(5.0, 15.0));
        Self { prices }
    }
}

impl PricingTable {
    /// The default table with `overrides` replacing or adding entries.
    pub fn with_overrides(overrides: &HashMap<String, ModelPrice>) -> Self {
        let mut table = Self::default();
        for (model, price) in overrides {
            table.prices.insert(model.clone(), *price);
        }
        table
    }

    /// Rates for `model`. A provider prefix such as `openai/` is ignored.
    pub fn lookup(&self, model: &str) -> ModelPrice {
        let name = model.rsplit_once('/').map(|(_, m)| m).unwrap_or(model);
        self.prices
            .get(model)
            .or_else(|| self.prices.get(name))
            .copied()
            .unwrap_or(ModelPrice::FREE)
    }

    pub fn usage(&self, model: &str, input_tokens: u64, output_tokens: u64) -> TokenUsage {
        let price = self.lookup(model);
        TokenUsage::new(
            model,
            input_tokens,
            output_tokens,
            price.input_per_million,
            price.output_per_million,
        )
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.usage(model, input_tokens, output_tokens).cost_usd
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Price a call against the built-in table.
pub fn cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    PricingTable::default().cost(model, input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_prices() {
        // 1M input at 0.15 + 1M output at 0.60
        let c = cost("gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((c - 0.75).abs() < 1e-9);
    }

    #[test]
    fn prefixed_model_prices() {
        let table = PricingTable::default();
        assert_eq!(table.lookup("openai/gpt-4o"), ModelPrice::new(5.0, 15.0));
    }

    #[test]
    fn unknown_model_returns_zero() {
        assert_eq!(cost("unknown-model", 100, 100), 0.0);
    }

    #[test]
    fn overrides_replace_defaults() {
        let mut overrides = HashMap::new();
        overrides.insert("gpt-4o".to_string(), ModelPrice::new(2.5, 10.0));
        overrides.insert("o1-mini".to_string(), ModelPrice::new(3.0, 12.0));

        let table = PricingTable::with_overrides(&overrides);
        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup("gpt-4o"), ModelPrice::new(2.5, 10.0));
        assert_eq!(table.lookup("gpt-4o-mini"), ModelPrice::new(0.15, 0.60));
        assert!(table.cost("o1-mini", 1_000_000, 0) > 2.9);
    }
}
