//! Per-model token prices and cost calculation

use crate::config::{ModelRate, PricingConfig};
use rust_decimal::Decimal;

/// Decimal places kept on a computed cost
pub const COST_SCALE: u32 = 8;

#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: Vec<ModelRate>,
    fallback_input: Decimal,
    fallback_output: Decimal,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

impl PricingTable {
    pub fn from_config(config: &PricingConfig) -> Self {
        let rates = config
            .models
            .iter()
            .map(|rate| ModelRate {
                pattern: rate.pattern.to_lowercase(),
                ..rate.clone()
            })
            .collect();

        Self {
            rates,
            fallback_input: config.fallback_input_per_million,
            fallback_output: config.fallback_output_per_million,
        }
    }

    /// (input, output) price per million tokens for `model`
    pub fn rates_for(&self, model: &str) -> (Decimal, Decimal) {
        let model = model.to_lowercase();
        self.rates
            .iter()
            .find(|rate| model.contains(&rate.pattern))
            .map(|rate| (rate.input_per_million, rate.output_per_million))
            .unwrap_or((self.fallback_input, self.fallback_output))
    }

    pub fn calculate_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
        let (input_rate, output_rate) = self.rates_for(model);
        let million = Decimal::from(1_000_000u32);

        let cost = Decimal::from(input_tokens) * input_rate / million
            + Decimal::from(output_tokens) * output_rate / million;
        cost.round_dp(COST_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_known_model_cost() {
        let table = PricingTable::default();

        // 1000 * 0.59/1M + 500 * 0.79/1M
        let cost = table.calculate_cost("llama-3.1-70b-versatile", 1000, 500);
        assert_eq!(cost, dec("0.000985"));
    }

    #[test]
    fn test_model_match_is_case_insensitive() {
        let table = PricingTable::default();
        assert_eq!(
            table.rates_for("Mixtral-8x7b-32768"),
            (dec("0.24"), dec("0.24"))
        );
        assert_eq!(table.rates_for("LLAMA3-8B-8192"), (dec("0.05"), dec("0.08")));
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let table = PricingTable::default();
        assert_eq!(table.rates_for("some-new-model"), (dec("0.10"), dec("0.10")));

        let cost = table.calculate_cost("some-new-model", 1_000_000, 0);
        assert_eq!(cost, dec("0.1"));
    }

    #[test]
    fn test_cost_rounded_to_eight_places() {
        let table = PricingTable::default();

        // 1 * 0.07 / 1M = 0.00000007
        assert_eq!(table.calculate_cost("gemma-7b-it", 1, 0), dec("0.00000007"));
        // 1 * 0.05 / 1M = 0.00000005, 1 * 0.08 / 1M = 0.00000008
        assert_eq!(table.calculate_cost("llama-3.1-8b-instant", 1, 1), dec("0.00000013"));
        assert!(table.calculate_cost("gemma2-9b-it", 3, 7).scale() <= COST_SCALE);
    }

    #[test]
    fn test_zero_tokens_cost_nothing() {
        let table = PricingTable::default();
        assert!(table.calculate_cost("mixtral-8x7b", 0, 0).is_zero());
    }

    #[test]
    fn test_configured_rates_override_defaults() {
        let config = PricingConfig {
            fallback_input_per_million: dec("1"),
            fallback_output_per_million: dec("2"),
            models: vec![ModelRate {
                pattern: "Custom".to_string(),
                input_per_million: dec("3"),
                output_per_million: dec("4"),
            }],
        };
        let table = PricingTable::from_config(&config);

        assert_eq!(table.rates_for("my-custom-model"), (dec("3"), dec("4")));
        assert_eq!(table.rates_for("mixtral"), (dec("1"), dec("2")));
    }
}
