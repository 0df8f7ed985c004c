//! Request cost estimation.
//!
//! Cost units feed the per-minute cost ceiling and nothing else; the
//! estimate never alters the payload.

use serde_json::Value;

/// Estimates the cost of a payload in abstract units.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, payload: &Value) -> u64;
}

impl<F> CostEstimator for F
where
    F: Fn(&Value) -> u64 + Send + Sync,
{
    fn estimate(&self, payload: &Value) -> u64 {
        self(payload)
    }
}

/// Approximates token counts from the compact JSON serialization,
/// roughly four characters per unit.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    chars_per_unit: u64,
}

impl CharEstimator {
    pub fn new(chars_per_unit: u64) -> Self {
        Self {
            chars_per_unit: chars_per_unit.max(1),
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CostEstimator for CharEstimator {
    fn estimate(&self, payload: &Value) -> u64 {
        let chars = payload.to_string().chars().count() as u64;
        chars.div_ceil(self.chars_per_unit)
    }
}
