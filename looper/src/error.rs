//! Typed errors raised by leaf components.
//!
//! Leaf components wrap these in `anyhow::Error`; the loop controller uses
//! `downcast_ref` to decide between retrying and halting.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::Tier;

/// Every model in the requested tier (and, with fallback, every lower tier)
/// is cooling down or none are configured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no models available in tier(s) {}", tiers_label(.tried))]
pub struct NoModelsAvailable {
    pub tried: Vec<Tier>,
}

fn tiers_label(tiers: &[Tier]) -> String {
    tiers
        .iter()
        .map(|tier| tier.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// The model's concurrency limit is already reached by live holders.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no concurrency slot available for model '{model}' (limit {limit})")]
pub struct NoSlotAvailable {
    pub model: String,
    pub limit: usize,
}

/// A live holder kept the lock for longer than the acquisition timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timed out after {waited:?} waiting for lock {} (held by pid {holder_pid:?})", .path.display())]
pub struct LockTimeout {
    pub path: PathBuf,
    pub waited: Duration,
    pub holder_pid: Option<u32>,
}

/// Another live loop process already holds the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session '{session}' is already active in pid {pid}")]
pub struct SessionBusy {
    pub session: String,
    pub pid: u32,
}

/// A store key contained characters outside `[A-Za-z0-9._-]` segments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid store key '{0}'")]
pub struct InvalidKey(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_models_message_lists_tiers_in_order() {
        let err = NoModelsAvailable {
            tried: vec![Tier::High, Tier::Medium, Tier::Low],
        };
        assert_eq!(
            err.to_string(),
            "no models available in tier(s) high -> medium -> low"
        );
    }
}
