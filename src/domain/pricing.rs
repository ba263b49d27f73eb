use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pricing row for a `(provider, model)` pair. Versioned by effective date;
/// resolution picks the row with the greatest `effective_date` not after the
/// observation's start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPrice {
    pub id: Uuid,
    pub provider: String,
    pub model_name: String,

    /// Optional regex matched against the observation's model name when no
    /// exact or canonical row exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_regex: Option<String>,

    /// Price per 1 million input tokens.
    pub input_per_1m: Decimal,

    /// Price per 1 million output tokens.
    pub output_per_1m: Decimal,

    /// Price per 1 million cache-read tokens, when the provider bills them
    /// separately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_per_1m: Option<Decimal>,

    pub effective_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ModelPrice {
    pub fn new(
        provider: impl Into<String>,
        model_name: impl Into<String>,
        input_per_1m: Decimal,
        output_per_1m: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            model_name: model_name.into(),
            model_regex: None,
            input_per_1m,
            output_per_1m,
            cache_read_per_1m: None,
            effective_date: now,
            created_at: now,
        }
    }

    pub fn with_effective_date(mut self, date: DateTime<Utc>) -> Self {
        self.effective_date = date;
        self
    }

    pub fn with_cache_read_price(mut self, per_1m: Decimal) -> Self {
        self.cache_read_per_1m = Some(per_1m);
        self
    }

    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.model_regex = Some(pattern.into());
        self
    }

    /// Compute the cost of the given token counts under this price row.
    /// Missing token classes contribute zero; a missing cache-read rate
    /// omits that component.
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64, cache_read_tokens: u64) -> Decimal {
        let million = Decimal::from(1_000_000u64);
        let mut cost = Decimal::from(input_tokens) * self.input_per_1m / million
            + Decimal::from(output_tokens) * self.output_per_1m / million;
        if let Some(cache_rate) = self.cache_read_per_1m {
            cost += Decimal::from(cache_read_tokens) * cache_rate / million;
        }
        cost.round_dp(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_per_token_cost() {
        let price = ModelPrice::new("openai", "gpt-4o", dec!(2.50), dec!(10.00));
        // 1000 input at $2.50/1M + 500 output at $10/1M
        assert_eq!(price.cost_for(1000, 500, 0), dec!(0.0075));
    }

    #[test]
    fn test_cache_read_component() {
        let price = ModelPrice::new("anthropic", "claude-sonnet", dec!(3.0), dec!(15.0))
            .with_cache_read_price(dec!(0.30));
        // 1M cache-read tokens at $0.30/1M
        assert_eq!(price.cost_for(0, 0, 1_000_000), dec!(0.30));
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        let price = ModelPrice::new("openai", "gpt-4o", dec!(2.50), dec!(10.00));
        assert_eq!(price.cost_for(0, 0, 0), Decimal::ZERO);
    }

    #[test]
    fn test_missing_cache_rate_omitted() {
        let price = ModelPrice::new("openai", "gpt-4o", dec!(2.50), dec!(10.00));
        assert_eq!(price.cost_for(0, 0, 1_000_000), Decimal::ZERO);
    }
}
