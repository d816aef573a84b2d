//! Cost ledger records and the per-session summary derived from them.

use serde::{Deserialize, Serialize};

/// One billed iteration in the host-wide ledger (append-only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostEntry {
    pub session: String,
    pub task: String,
    pub cost: f64,
    pub workdir: String,
    pub model: String,
    pub iteration: u32,
    /// RFC 3339.
    pub recorded_at: String,
}

/// Per-session cache of spend, rebuildable from the session cost log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CostSummary {
    pub session: String,
    pub total: f64,
    pub iterations: Vec<IterationCost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationCost {
    pub iteration: u32,
    pub model: String,
    pub cost: f64,
}

/// Build a summary from a session's cost entries, in log order.
pub fn summarize(session: &str, entries: &[CostEntry]) -> CostSummary {
    CostSummary {
        session: session.to_string(),
        total: entries.iter().map(|e| e.cost).sum(),
        iterations: entries
            .iter()
            .map(|e| IterationCost {
                iteration: e.iteration,
                model: e.model.clone(),
                cost: e.cost,
            })
            .collect(),
    }
}
