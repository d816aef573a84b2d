//! Read-side commands: `looper list`, `looper status`, and `looper inject`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::core::types::{IterationHistory, IterationRecord, SessionState};
use crate::io::config::LooperConfig;
use crate::io::context::inject_context;
use crate::io::cost::CostLedger;
use crate::io::pid::is_alive;
use crate::io::rate_limits::ModelRegistry;
use crate::io::session::{SessionPaths, history_key, list_sessions, load_session};
use crate::io::slots::SlotManager;
use crate::io::store::{FileStore, Store};

/// Records shown by `looper status`.
const RECENT_RECORDS: usize = 5;

/// One row of `looper list`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub state: SessionState,
    pub spent: f64,
    /// Marked active but the owning process is gone.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub summary: SessionSummary,
    pub history: IterationHistory,
    pub pending_context: bool,
    /// `(model, seconds remaining)` for host-wide cooldowns.
    pub cooldowns: Vec<(String, i64)>,
    /// Held concurrency slots per model, host-wide.
    pub slots: BTreeMap<String, usize>,
}

pub fn list(store: &FileStore) -> Result<Vec<SessionSummary>> {
    let ledger = CostLedger::new(store);
    list_sessions(store)?
        .into_iter()
        .map(|state| {
            let spent = ledger.total_for(&state.id)?;
            Ok(summarize(state, spent))
        })
        .collect()
}

pub fn status(store: &FileStore, cfg: &LooperConfig, id: &str) -> Result<SessionStatus> {
    let state = load_session(store, id)?.ok_or_else(|| anyhow!("unknown session '{id}'"))?;
    let spent = CostLedger::new(store).total_for(id)?;
    let history: IterationHistory = store.read(&history_key(id))?;
    let paths = SessionPaths::new(store.root(), id);
    Ok(SessionStatus {
        summary: summarize(state, spent),
        history,
        pending_context: paths.pending_context_path.exists(),
        cooldowns: ModelRegistry::new(store, &cfg.models).cooldowns()?,
        slots: SlotManager::new(store, &cfg.concurrency).usage()?,
    })
}

/// Queue a note for the session's next iteration.
pub fn inject(store: &FileStore, cfg: &LooperConfig, id: &str, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(anyhow!("refusing to inject empty context"));
    }
    load_session(store, id)?.ok_or_else(|| anyhow!("unknown session '{id}'"))?;
    inject_context(&SessionPaths::new(store.root(), id), text, &cfg.lock_options())?;
    info!(session = id, bytes = text.len(), "context injected");
    Ok(())
}

fn summarize(state: SessionState, spent: f64) -> SessionSummary {
    let stale = state.active && !state.owner_pid.is_some_and(is_alive);
    SessionSummary {
        state,
        spent,
        stale,
    }
}

fn activity(summary: &SessionSummary) -> &'static str {
    match (summary.state.active, summary.stale) {
        (true, false) => "active",
        (true, true) => "stale",
        (false, _) => "idle",
    }
}

/// One line per session.
pub fn render_list(sessions: &[SessionSummary]) -> String {
    if sessions.is_empty() {
        return "no sessions\n".to_string();
    }
    let mut out = String::new();
    for s in sessions {
        let _ = writeln!(
            out,
            "{}\t{}\titer {}\t${:.2}\t{}",
            s.state.id,
            activity(s),
            s.state.iteration,
            s.spent,
            first_line(&s.state.task)
        );
    }
    out
}

pub fn render_status(status: &SessionStatus) -> String {
    let s = &status.summary;
    let state = &s.state;
    let mut out = String::new();
    let _ = writeln!(out, "session:     {}", state.id);
    let _ = writeln!(out, "status:      {}", activity(s));
    if let Some(pid) = state.owner_pid {
        let _ = writeln!(out, "owner pid:   {pid}");
    }
    let _ = writeln!(out, "task:        {}", first_line(&state.task));
    let _ = writeln!(out, "workdir:     {}", state.workdir);
    let max = if state.max_iterations == 0 {
        format!("unlimited (ceiling {})", state.iteration_ceiling())
    } else {
        state.max_iterations.to_string()
    };
    let _ = writeln!(
        out,
        "iterations:  {} (min {}, max {})",
        state.iteration, state.min_iterations, max
    );
    let _ = writeln!(
        out,
        "model:       {}",
        state.model.as_deref().unwrap_or("auto")
    );
    let _ = writeln!(out, "tier:        {}", state.tier);
    let _ = writeln!(out, "spent:       ${:.2}", s.spent);
    let struggle = status.history.struggle;
    let _ = writeln!(
        out,
        "struggle:    {} without changes, {} short",
        struggle.consecutive_no_changes, struggle.consecutive_short
    );
    if status.pending_context {
        let _ = writeln!(out, "pending:     context queued for next iteration");
    }
    if let Some(stop) = &state.last_stop {
        let _ = writeln!(out, "last stop:   {stop}");
    }
    for (model, remaining) in &status.cooldowns {
        let _ = writeln!(out, "cooldown:    {model} ({remaining}s left)");
    }
    for (model, held) in &status.slots {
        let _ = writeln!(out, "slots:       {model} x{held}");
    }
    let recent = status.history.records.len().saturating_sub(RECENT_RECORDS);
    for record in &status.history.records[recent..] {
        let _ = writeln!(out, "{}", render_record(record));
    }
    out
}

fn render_record(record: &IterationRecord) -> String {
    let exit = record
        .exit_code
        .map_or_else(|| "killed".to_string(), |code| format!("exit {code}"));
    let cost = record
        .cost
        .map_or_else(String::new, |cost| format!(" ${cost:.2}"));
    let done = if record.completion_detected {
        " [marker]"
    } else {
        ""
    };
    format!(
        "  #{} {} {} {:.1}s {} files{}{}",
        record.iteration,
        record.model,
        exit,
        record.duration_ms as f64 / 1000.0,
        record.changed_files.len(),
        cost,
        done
    )
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
