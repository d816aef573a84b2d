//! Orchestration for claiming a session (the loop's `Initializing` state).
//!
//! A session is created on the first run of an id and resumed afterwards.
//! Claiming checks and sets `active` + `owner_pid` inside a single locked
//! store update, so two processes can never both observe "inactive" and both
//! proceed. An active session whose owner process is gone, or whose claim
//! has not been touched for longer than the staleness threshold, is taken
//! over.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::session_id::generate_session_id;
use crate::core::types::{CompletionMode, SessionState, Tier};
use crate::error::SessionBusy;
use crate::io::pid::{current_pid, is_alive};
use crate::io::session::{SessionPaths, load_session, state_key, validate_session_id};
use crate::io::store::{FileStore, Store};

/// Per-invocation session settings. `None` keeps the stored value on resume
/// and the default on creation.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub task: Option<String>,
    pub workdir: Option<PathBuf>,
    pub tier: Option<Tier>,
    pub model: Option<String>,
    pub min_iterations: Option<u32>,
    pub max_iterations: Option<u32>,
    pub marker_text: Option<String>,
    pub completion_mode: Option<CompletionMode>,
}

/// Outcome of claiming a session.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub state: SessionState,
    pub resumed: bool,
    /// PID of a dead or stale previous owner whose claim was taken over.
    pub took_over_from: Option<u32>,
}

/// Claim `id` (or a freshly generated id) for this process. A live owner
/// keeps its claim unless `updated_at` is older than `stale_after`, which
/// covers a crashed owner whose PID was reused.
#[instrument(skip(store, settings))]
pub fn claim_session(
    store: &FileStore,
    id: Option<&str>,
    settings: &SessionSettings,
    stale_after: Duration,
) -> Result<StartOutcome> {
    let id = match id {
        Some(id) => {
            validate_session_id(id)?;
            id.to_string()
        }
        None => fresh_session_id(store)?,
    };
    let pid = current_pid();
    let now = Utc::now().to_rfc3339();

    let mut resumed = false;
    let mut took_over_from = None;
    let state = store.update(&state_key(&id), |state: &mut SessionState| {
        resumed = !state.id.is_empty();
        if resumed && state.active {
            match state.owner_pid {
                Some(owner)
                    if owner != pid
                        && is_alive(owner)
                        && !claim_expired(state.updated_at.as_deref(), stale_after) =>
                {
                    return Err(SessionBusy {
                        session: id.clone(),
                        pid: owner,
                    }
                    .into());
                }
                Some(owner) if owner != pid => took_over_from = Some(owner),
                _ => {}
            }
        }
        if !resumed {
            *state = new_session(&id, settings, &now)?;
        } else {
            apply_settings(state, settings);
        }
        state.active = true;
        state.owner_pid = Some(pid);
        state.retries = 0;
        state.last_stop = None;
        state.updated_at = Some(now.clone());
        Ok(())
    })?;

    SessionPaths::new(store.root(), &id).ensure()?;
    if let Some(owner) = took_over_from {
        warn!(session = %id, owner, "took over stale session claim");
    }
    info!(session = %id, resumed, iteration = state.iteration, "session claimed");
    Ok(StartOutcome {
        state,
        resumed,
        took_over_from,
    })
}

/// Mark the session inactive and record why it stopped. Only the owning
/// process clears its own claim.
pub fn release_session(store: &FileStore, id: &str, reason: &str) -> Result<SessionState> {
    let pid = current_pid();
    let now = Utc::now().to_rfc3339();
    let state = store.update(&state_key(id), |state: &mut SessionState| {
        if state.owner_pid.is_some_and(|owner| owner != pid) {
            warn!(session = id, owner = ?state.owner_pid, "session owned by another process, leaving claim");
            return Ok(());
        }
        state.active = false;
        state.owner_pid = None;
        state.last_stop = Some(reason.to_string());
        state.updated_at = Some(now);
        Ok(())
    })?;
    debug!(session = id, reason, "session released");
    Ok(state)
}

fn claim_expired(updated_at: Option<&str>, stale_after: Duration) -> bool {
    let Some(at) = updated_at.and_then(|t| DateTime::parse_from_rfc3339(t).ok()) else {
        return false;
    };
    Utc::now()
        .signed_duration_since(at.with_timezone(&Utc))
        .to_std()
        .is_ok_and(|age| age > stale_after)
}

fn new_session(id: &str, settings: &SessionSettings, now: &str) -> Result<SessionState> {
    let task = settings
        .task
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow!("session '{id}' does not exist yet; a task is required to create it"))?;
    let workdir = settings
        .workdir
        .as_deref()
        .ok_or_else(|| anyhow!("session '{id}' needs a working directory"))?;
    let mut state = SessionState {
        id: id.to_string(),
        task: task.to_string(),
        workdir: display_path(workdir),
        started_at: Some(now.to_string()),
        ..SessionState::default()
    };
    apply_settings(&mut state, &SessionSettings {
        task: None,
        workdir: None,
        ..settings.clone()
    });
    Ok(state)
}

fn apply_settings(state: &mut SessionState, settings: &SessionSettings) {
    if let Some(task) = settings.task.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        state.task = task.to_string();
    }
    if let Some(workdir) = &settings.workdir {
        state.workdir = display_path(workdir);
    }
    if let Some(tier) = settings.tier {
        state.tier = tier;
    }
    if let Some(model) = &settings.model {
        state.model = Some(model.clone());
    }
    if let Some(min) = settings.min_iterations {
        state.min_iterations = min;
    }
    if let Some(max) = settings.max_iterations {
        state.max_iterations = max;
    }
    if let Some(marker) = &settings.marker_text {
        state.marker_text = marker.clone();
    }
    if let Some(mode) = settings.completion_mode {
        state.completion_mode = mode;
    }
}

fn fresh_session_id(store: &FileStore) -> Result<String> {
    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let id = generate_session_id(&mut rng);
        if load_session(store, &id)?.is_none() {
            return Ok(id);
        }
        debug!(session = %id, "generated id already exists, re-rolling");
    }
    Err(anyhow!("could not generate an unused session id"))
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::lock::LockOptions;

    const DAY: Duration = Duration::from_secs(86_400);

    fn settings(task: &str, workdir: &Path) -> SessionSettings {
        SessionSettings {
            task: Some(task.to_string()),
            workdir: Some(workdir.to_path_buf()),
            ..SessionSettings::default()
        }
    }

    #[test]
    fn first_claim_creates_an_active_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        let outcome =
            claim_session(&store, None, &settings("do it", temp.path()), DAY).expect("claim");

        assert!(!outcome.resumed);
        assert!(outcome.state.active);
        assert_eq!(outcome.state.owner_pid, Some(current_pid()));
        assert_eq!(outcome.state.task, "do it");
        assert_eq!(outcome.state.id.split('-').count(), 4);
        assert!(SessionPaths::new(temp.path(), &outcome.state.id).logs_dir.is_dir());
    }

    #[test]
    fn new_session_requires_a_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        let err = claim_session(
            &store,
            Some("fresh"),
            &SessionSettings {
                workdir: Some(temp.path().to_path_buf()),
                ..SessionSettings::default()
            },
            DAY,
        )
        .unwrap_err();
        assert!(err.to_string().contains("task is required"));
        assert!(load_session(&store, "fresh").expect("load").is_none());
    }

    #[test]
    fn resume_keeps_progress_and_applies_overrides() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        claim_session(&store, Some("job"), &settings("task", temp.path()), DAY).expect("claim");
        store
            .update(&state_key("job"), |s: &mut SessionState| {
                s.iteration = 4;
                Ok(())
            })
            .expect("bump");
        release_session(&store, "job", "interrupted").expect("release");

        let outcome = claim_session(
            &store,
            Some("job"),
            &SessionSettings {
                max_iterations: Some(9),
                ..SessionSettings::default()
            },
            DAY,
        )
        .expect("resume");
        assert!(outcome.resumed);
        assert_eq!(outcome.state.iteration, 4);
        assert_eq!(outcome.state.max_iterations, 9);
        assert_eq!(outcome.state.task, "task");
        assert_eq!(outcome.state.last_stop, None);
    }

    #[cfg(unix)]
    #[test]
    fn live_owner_blocks_and_dead_owner_is_taken_over() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        claim_session(&store, Some("job"), &settings("task", temp.path()), DAY).expect("claim");

        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn");
        let live = child.id();
        store
            .update(&state_key("job"), |s: &mut SessionState| {
                s.owner_pid = Some(live);
                Ok(())
            })
            .expect("set owner");
        let err =
            claim_session(&store, Some("job"), &SessionSettings::default(), DAY).unwrap_err();
        let busy = err.downcast_ref::<SessionBusy>().expect("SessionBusy");
        assert_eq!(busy.pid, live);

        child.kill().expect("kill");
        child.wait().expect("reap");
        let outcome = claim_session(&store, Some("job"), &SessionSettings::default(), DAY)
            .expect("take over");
        assert_eq!(outcome.took_over_from, Some(live));
        assert_eq!(outcome.state.owner_pid, Some(current_pid()));
    }

    #[cfg(unix)]
    #[test]
    fn live_owner_with_an_old_claim_is_taken_over() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        claim_session(&store, Some("job"), &settings("task", temp.path()), DAY).expect("claim");

        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn");
        let reused = child.id();
        let old = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        store
            .update(&state_key("job"), |s: &mut SessionState| {
                s.owner_pid = Some(reused);
                s.updated_at = Some(old.clone());
                Ok(())
            })
            .expect("age claim");

        let outcome = claim_session(
            &store,
            Some("job"),
            &SessionSettings::default(),
            Duration::from_secs(3_600),
        )
        .expect("take over");
        assert_eq!(outcome.took_over_from, Some(reused));
        assert_eq!(outcome.state.owner_pid, Some(current_pid()));
        assert_ne!(outcome.state.updated_at, Some(old));

        child.kill().expect("kill");
        child.wait().expect("reap");
    }

    #[test]
    fn claim_age_is_measured_from_updated_at() {
        let hour = Duration::from_secs(3_600);
        let recent = Utc::now().to_rfc3339();
        let old = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        assert!(!claim_expired(Some(&recent), hour));
        assert!(claim_expired(Some(&old), hour));
        assert!(!claim_expired(None, hour));
        assert!(!claim_expired(Some("not a timestamp"), hour));
    }

    #[test]
    fn release_marks_inactive_with_reason() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path(), LockOptions::default());
        claim_session(&store, Some("job"), &settings("task", temp.path()), DAY).expect("claim");
        let state = release_session(&store, "job", "completed at iteration 2").expect("release");
        assert!(!state.active);
        assert_eq!(state.owner_pid, None);
        assert_eq!(state.last_stop.as_deref(), Some("completed at iteration 2"));
    }
}
