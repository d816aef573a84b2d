//! Process-external lock files with stale-holder recovery.
//!
//! A lock is a file created with `create_new` that records the holder's PID,
//! acquisition time, and a unique token. Holders can die without unlocking
//! (SIGKILL, crash), so a lock whose PID is gone or whose timestamp is older
//! than the staleness threshold is broken and reacquired instead of blocking
//! forever.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LockTimeout;
use crate::io::pid::{current_pid, is_alive};

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Timing knobs for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// A holder older than this is considered dead.
    pub stale_after: Duration,
    /// Give up waiting on a live holder after this long.
    pub timeout: Duration,
    /// Sleep between acquisition attempts.
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub pid: u32,
    /// Epoch seconds.
    pub acquired_at: i64,
    pub token: String,
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
    released: bool,
}

impl FileLock {
    /// Acquire the lock at `path`, breaking stale holders.
    pub fn acquire(path: &Path, options: &LockOptions) -> Result<FileLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let started = Instant::now();
        let token = new_token();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid: current_pid(),
                        acquired_at: Utc::now().timestamp(),
                        token: token.clone(),
                    };
                    let payload = serde_json::to_string(&record).context("serialize lock")?;
                    file.write_all(payload.as_bytes())
                        .with_context(|| format!("write lock {}", path.display()))?;
                    return Ok(FileLock {
                        path: path.to_path_buf(),
                        token,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_record(path);
                    if is_stale(path, holder.as_ref(), options.stale_after) {
                        break_stale(path, holder.as_ref(), options)?;
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= options.timeout {
                        return Err(LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                            holder_pid: holder.map(|h| h.pid),
                        }
                        .into());
                    }
                    thread::sleep(options.poll_interval);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }

    /// Release the lock, removing the file only if it still carries our token.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_record(&self.path) {
            Some(record) if record.token == self.token => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("remove lock {}", self.path.display()))
                }
            },
            Some(record) => {
                warn!(
                    path = %self.path.display(),
                    holder_pid = record.pid,
                    "lock was broken as stale and reacquired by another holder"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, path = %self.path.display(), "failed to release lock");
        }
    }
}

/// Lock file guarding `file` (`<file>.lock`).
pub fn lock_path_for(file: &Path) -> PathBuf {
    let mut name = OsString::from(file.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn new_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos}-{seq}", current_pid())
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// A holder is stale if its PID is gone or it is older than `stale_after`.
/// Unreadable lock files (mid-write or corrupt) are stale only by file age.
fn is_stale(path: &Path, holder: Option<&LockRecord>, stale_after: Duration) -> bool {
    match holder {
        Some(record) => {
            if !is_alive(record.pid) {
                return true;
            }
            let age = Utc::now().timestamp().saturating_sub(record.acquired_at);
            age > i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX)
        }
        None => file_age(path).is_some_and(|age| age > stale_after),
    }
}

fn breaker_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".break");
    PathBuf::from(name)
}

/// Remove a stale lock. Breakers are serialized through a short-lived
/// `.break` marker and re-check the holder so a fresh lock taken by a
/// concurrent breaker is never removed.
fn break_stale(path: &Path, observed: Option<&LockRecord>, options: &LockOptions) -> Result<()> {
    let breaker = breaker_path(path);
    match OpenOptions::new().write(true).create_new(true).open(&breaker) {
        Ok(_) => {
            let current = read_record(path);
            let unchanged = current.as_ref().map(|r| &r.token) == observed.map(|r| &r.token);
            if unchanged && is_stale(path, current.as_ref(), options.stale_after) {
                debug!(
                    path = %path.display(),
                    holder_pid = ?current.as_ref().map(|r| r.pid),
                    "breaking stale lock"
                );
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        let _ = fs::remove_file(&breaker);
                        return Err(err)
                            .with_context(|| format!("remove stale lock {}", path.display()));
                    }
                }
            }
            fs::remove_file(&breaker)
                .with_context(|| format!("remove lock breaker {}", breaker.display()))
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            // Another process is breaking the lock; a breaker that died
            // mid-break is cleared once it ages past the threshold.
            if file_age(&breaker).is_some_and(|age| age > options.stale_after) {
                let _ = fs::remove_file(&breaker);
            } else {
                thread::sleep(options.poll_interval);
            }
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("create lock breaker {}", breaker.display())),
    }
}
