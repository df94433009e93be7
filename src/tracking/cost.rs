//! Cost computation (§4.I): pure function of token usage and the pricing
//! table, so it can be property-tested independent of any storage.

use crate::config::ModelPricing;
use crate::lifecycle::TokenUsage;

const PER_MILLION: f64 = 1_000_000.0;

pub fn compute_cost(pricing: &ModelPricing, usage: &TokenUsage) -> f64 {
    usage.input as f64 / PER_MILLION * pricing.input
        + usage.output as f64 / PER_MILLION * pricing.output
        + usage.cache_creation as f64 / PER_MILLION * pricing.cache_creation
        + usage.cache_read as f64 / PER_MILLION * pricing.cache_read
}
