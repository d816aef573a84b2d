//! Cost ledger: host-wide append-only log plus per-session summaries.

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::costs::{CostEntry, CostSummary, summarize};
use crate::io::session::{cost_summary_key, costs_key};
use crate::io::store::Store;

/// Host-wide ledger key (`ledger.jsonl`).
pub const LEDGER_KEY: &str = "ledger";

/// Where an iteration's spend is attributed.
#[derive(Debug, Clone)]
pub struct CostContext<'a> {
    pub session: &'a str,
    pub task: &'a str,
    pub workdir: &'a str,
}

pub struct CostLedger<'a, S: Store> {
    store: &'a S,
}

impl<'a, S: Store> CostLedger<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Append the iteration's cost to the global ledger and the session log,
    /// then refresh the session summary. Returns the new session total.
    pub fn record_iteration(
        &self,
        ctx: &CostContext<'_>,
        model: &str,
        iteration: u32,
        cost: f64,
    ) -> Result<f64> {
        let entry = CostEntry {
            session: ctx.session.to_string(),
            task: ctx.task.to_string(),
            cost,
            workdir: ctx.workdir.to_string(),
            model: model.to_string(),
            iteration,
            recorded_at: Utc::now().to_rfc3339(),
        };
        self.store.append(LEDGER_KEY, &entry)?;
        self.store.append(&costs_key(ctx.session), &entry)?;
        let summary = self.rebuild_summary(ctx.session)?;
        debug!(session = ctx.session, model, iteration, cost, total = summary.total, "cost recorded");
        Ok(summary.total)
    }

    /// Session spend from the summary cache, rebuilding it when it is missing
    /// or unreadable.
    pub fn total_for(&self, session: &str) -> Result<f64> {
        match self.store.read::<CostSummary>(&cost_summary_key(session)) {
            Ok(summary) if summary.session == session => Ok(summary.total),
            Ok(_) => Ok(self.rebuild_summary(session)?.total),
            Err(err) => {
                warn!(session, err = %err, "cost summary unreadable, rebuilding");
                Ok(self.rebuild_summary(session)?.total)
            }
        }
    }

    /// Recompute the summary from the session's cost log.
    pub fn rebuild_summary(&self, session: &str) -> Result<CostSummary> {
        let entries: Vec<CostEntry> = self.store.read_log(&costs_key(session))?;
        let summary = summarize(session, &entries);
        self.store.write(&cost_summary_key(session), &summary)?;
        Ok(summary)
    }

    /// Every entry in the host-wide ledger.
    pub fn entries(&self) -> Result<Vec<CostEntry>> {
        self.store.read_log(LEDGER_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lock::LockOptions;
    use crate::io::store::FileStore;
    use std::fs;

    fn ctx() -> CostContext<'static> {
        CostContext {
            session: "s1",
            task: "fix the bug",
            workdir: "/repo",
        }
    }

    #[test]
    fn records_accumulate_per_session_and_globally() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        let ledger = CostLedger::new(&store);

        ledger.record_iteration(&ctx(), "A", 1, 1.25).expect("record");
        let total = ledger.record_iteration(&ctx(), "B", 2, 0.75).expect("record");
        assert_eq!(total, 2.0);
        assert_eq!(ledger.total_for("s1").expect("total"), 2.0);
        assert_eq!(ledger.total_for("other").expect("total"), 0.0);

        let entries = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].model, "B");
    }

    #[test]
    fn corrupt_summary_is_rebuilt_from_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        let ledger = CostLedger::new(&store);
        ledger.record_iteration(&ctx(), "A", 1, 3.0).expect("record");

        let path = store.value_path(&cost_summary_key("s1")).expect("path");
        fs::write(&path, "{not json").expect("corrupt");

        assert_eq!(ledger.total_for("s1").expect("total"), 3.0);
        let summary: CostSummary = store.read(&cost_summary_key("s1")).expect("read");
        assert_eq!(summary.iterations.len(), 1);
    }
}
