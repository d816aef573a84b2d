//! One-shot notes delivered into the next iteration's prompt.
//!
//! Pending context (injected by a human mid-loop) and validator feedback are
//! each consumed the moment they are read: at-most-once delivery. Both are
//! guarded by a lock file so an `inject` racing a consume is never lost or
//! delivered twice.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::io::lock::{FileLock, LockOptions, lock_path_for};
use crate::io::session::SessionPaths;

/// Append a note for the next iteration.
pub fn inject_context(paths: &SessionPaths, text: &str, lock: &LockOptions) -> Result<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    paths.ensure()?;
    let path = &paths.pending_context_path;
    let guard = FileLock::acquire(&lock_path_for(path), lock)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{text}\n").with_context(|| format!("append {}", path.display()))?;
    guard.release()
}

/// Read and delete the pending context, if any.
pub fn take_pending_context(paths: &SessionPaths, lock: &LockOptions) -> Result<Option<String>> {
    take_once(&paths.pending_context_path, lock)
}

/// Store validator-rejection feedback for the next iteration (replacing any
/// unread feedback).
pub fn write_validator_feedback(paths: &SessionPaths, feedback: &str) -> Result<()> {
    paths.ensure()?;
    let path = &paths.validator_feedback_path;
    fs::write(path, feedback).with_context(|| format!("write {}", path.display()))
}

pub fn take_validator_feedback(paths: &SessionPaths, lock: &LockOptions) -> Result<Option<String>> {
    take_once(&paths.validator_feedback_path, lock)
}

/// Drop undelivered one-shot notes at the end of a loop.
pub fn discard_one_shot(paths: &SessionPaths, lock: &LockOptions) -> Result<()> {
    take_pending_context(paths, lock)?;
    take_validator_feedback(paths, lock)?;
    Ok(())
}

/// The agent's scratch notes, empty when absent.
pub fn read_notes(paths: &SessionPaths) -> Result<String> {
    match fs::read_to_string(&paths.notes_path) {
        Ok(notes) => Ok(notes),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", paths.notes_path.display())),
    }
}

/// Wipe the agent's scratch notes (periodic fresh-eyes reset).
pub fn reset_notes(paths: &SessionPaths) -> Result<()> {
    remove_if_exists(&paths.notes_path)
}

fn take_once(path: &Path, lock: &LockOptions) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let guard = FileLock::acquire(&lock_path_for(path), lock)?;
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    remove_if_exists(path)?;
    guard.release()?;
    debug!(path = %path.display(), bytes = contents.len(), "consumed one-shot note");
    let trimmed = contents.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path) -> SessionPaths {
        let paths = SessionPaths::new(root, "s1");
        paths.ensure().expect("ensure");
        paths
    }

    #[test]
    fn pending_context_is_delivered_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let lock = LockOptions::default();

        inject_context(&paths, "first", &lock).expect("inject");
        inject_context(&paths, "second", &lock).expect("inject");

        let taken = take_pending_context(&paths, &lock)
            .expect("take")
            .expect("some context");
        assert!(taken.contains("first"));
        assert!(taken.contains("second"));
        assert!(take_pending_context(&paths, &lock).expect("take").is_none());
    }

    #[test]
    fn blank_injection_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        inject_context(&paths, "   ", &LockOptions::default()).expect("inject");
        assert!(!paths.pending_context_path.exists());
    }

    #[test]
    fn discard_removes_both_notes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let lock = LockOptions::default();
        inject_context(&paths, "ctx", &lock).expect("inject");
        write_validator_feedback(&paths, "not done").expect("feedback");

        discard_one_shot(&paths, &lock).expect("discard");
        assert!(!paths.pending_context_path.exists());
        assert!(!paths.validator_feedback_path.exists());
    }

    #[test]
    fn reset_notes_wipes_scratch_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        fs::write(&paths.notes_path, "tried X").expect("write notes");
        assert_eq!(read_notes(&paths).expect("read"), "tried X");
        reset_notes(&paths).expect("reset");
        assert_eq!(read_notes(&paths).expect("read"), "");
    }
}
