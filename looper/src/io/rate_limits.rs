//! Host-wide model cooldown registry over the shared `rate_limits` key.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument};

use crate::core::selector::{RateLimitTable, TierModels, is_rate_limited, next_available_model};
use crate::core::types::Tier;
use crate::io::store::Store;

pub const RATE_LIMITS_KEY: &str = "rate_limits";

/// Model selection backed by the shared cooldown table.
pub struct ModelRegistry<'a, S: Store> {
    store: &'a S,
    tiers: &'a TierModels,
}

impl<'a, S: Store> ModelRegistry<'a, S> {
    pub fn new(store: &'a S, tiers: &'a TierModels) -> Self {
        Self { store, tiers }
    }

    pub fn tiers(&self) -> &TierModels {
        self.tiers
    }

    /// First model in `tier` that is not cooling down, descending tiers when
    /// `allow_fallback` is set. Fails with `NoModelsAvailable`.
    pub fn next_available_model(&self, tier: Tier, allow_fallback: bool) -> Result<String> {
        let table: RateLimitTable = self.store.read(RATE_LIMITS_KEY)?;
        let model = next_available_model(
            self.tiers,
            &table,
            tier,
            allow_fallback,
            Utc::now().timestamp(),
        )?;
        Ok(model)
    }

    pub fn is_cooling_down(&self, model: &str) -> Result<bool> {
        let table: RateLimitTable = self.store.read(RATE_LIMITS_KEY)?;
        Ok(is_rate_limited(&table, model, Utc::now().timestamp()))
    }

    /// Put `model` on cooldown until `now + cooldown` (last write wins).
    /// Expired entries are dropped in the same update.
    #[instrument(skip(self))]
    pub fn mark_rate_limited(&self, model: &str, cooldown: Duration) -> Result<i64> {
        let now = Utc::now().timestamp();
        let secs = i64::try_from(cooldown.as_secs()).unwrap_or(i64::MAX);
        let until = now.saturating_add(secs);
        self.store.update(RATE_LIMITS_KEY, |table: &mut RateLimitTable| {
            table.retain(|_, expiry| *expiry > now);
            table.insert(model.to_string(), until);
            Ok(())
        })?;
        info!(model, until, "model marked rate-limited");
        Ok(until)
    }

    /// Active cooldowns as `(model, seconds remaining)`.
    pub fn cooldowns(&self) -> Result<Vec<(String, i64)>> {
        let table: RateLimitTable = self.store.read(RATE_LIMITS_KEY)?;
        let now = Utc::now().timestamp();
        Ok(table
            .into_iter()
            .filter(|(_, expiry)| *expiry > now)
            .map(|(model, expiry)| (model, expiry - now))
            .collect())
    }
}
