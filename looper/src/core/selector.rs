//! Deterministic model selection over tiers and a cooldown table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::Tier;
use crate::error::NoModelsAvailable;

/// Model identifier -> cooldown expiry (epoch seconds).
pub type RateLimitTable = BTreeMap<String, i64>;

/// Ordered model lists per tier. Declared order is selection order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TierModels {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            high: vec!["opus".to_string()],
            medium: vec!["sonnet".to_string()],
            low: vec!["haiku".to_string()],
        }
    }
}

impl TierModels {
    pub fn models(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::High => &self.high,
            Tier::Medium => &self.medium,
            Tier::Low => &self.low,
        }
    }
}

/// A model is rate-limited iff it has an entry that expires in the future.
pub fn is_rate_limited(table: &RateLimitTable, model: &str, now: i64) -> bool {
    table.get(model).is_some_and(|expiry| *expiry > now)
}

/// Pick the first model in `tier` (declared order) that is not cooling down.
///
/// With `allow_fallback`, exhausted tiers descend `high -> medium -> low`.
pub fn next_available_model(
    tiers: &TierModels,
    table: &RateLimitTable,
    tier: Tier,
    allow_fallback: bool,
    now: i64,
) -> Result<String, NoModelsAvailable> {
    let mut tried = Vec::new();
    let mut current = Some(tier);
    while let Some(t) = current {
        tried.push(t);
        if let Some(model) = tiers
            .models(t)
            .iter()
            .find(|model| !is_rate_limited(table, model, now))
        {
            return Ok(model.clone());
        }
        current = if allow_fallback { t.lower() } else { None };
    }
    Err(NoModelsAvailable { tried })
}

/// Tier a model is declared in, searching from high to low.
pub fn tier_of(tiers: &TierModels, model: &str) -> Option<Tier> {
    [Tier::High, Tier::Medium, Tier::Low]
        .into_iter()
        .find(|tier| tiers.models(*tier).iter().any(|m| m == model))
}
