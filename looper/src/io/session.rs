//! Per-session layout under `<state root>/sessions/<id>/`.
//!
//! Store-managed records (state, history, cost log, cost summary) are
//! addressed by key; free-form artifacts (pending context, validator
//! feedback, agent notes, raw logs) are plain files in the session directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::warn;

use crate::core::session_id::is_valid_session_id;
use crate::core::types::SessionState;
use crate::io::store::{FileStore, Store};

pub const SESSIONS_DIR: &str = "sessions";

pub fn state_key(id: &str) -> String {
    format!("{SESSIONS_DIR}/{id}/state")
}

pub fn history_key(id: &str) -> String {
    format!("{SESSIONS_DIR}/{id}/history")
}

pub fn costs_key(id: &str) -> String {
    format!("{SESSIONS_DIR}/{id}/costs")
}

pub fn cost_summary_key(id: &str) -> String {
    format!("{SESSIONS_DIR}/{id}/cost_summary")
}

/// Session ids become a single path segment.
pub fn validate_session_id(id: &str) -> Result<()> {
    if is_valid_session_id(id) {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid session id '{id}' (use letters, digits, '-', '_' or '.')"
        ))
    }
}

/// Resolved paths for session artifacts.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub pending_context_path: PathBuf,
    pub validator_feedback_path: PathBuf,
    pub notes_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(state_root: &Path, id: &str) -> Self {
        let dir = state_root.join(SESSIONS_DIR).join(id);
        Self {
            pending_context_path: dir.join("pending_context.md"),
            validator_feedback_path: dir.join("validator_feedback.md"),
            notes_path: dir.join("notes.md"),
            logs_dir: dir.join("logs"),
            dir,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.logs_dir)
            .with_context(|| format!("create session dir {}", self.logs_dir.display()))
    }
}

/// Load a session, `None` if it was never created.
pub fn load_session(store: &FileStore, id: &str) -> Result<Option<SessionState>> {
    validate_session_id(id)?;
    let state: SessionState = store.read(&state_key(id))?;
    Ok((!state.id.is_empty()).then_some(state))
}

/// All sessions with a readable state record, sorted by start time then id.
pub fn list_sessions(store: &FileStore) -> Result<Vec<SessionState>> {
    let dir = store.root().join(SESSIONS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };

    let mut sessions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(id) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_session_id(&id).is_err() {
            continue;
        }
        match load_session(store, &id) {
            Ok(Some(state)) => sessions.push(state),
            Ok(None) => {}
            Err(err) => warn!(session = %id, err = %err, "skipping unreadable session"),
        }
    }
    sessions.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(sessions)
}
