//! Process liveness and process-group signalling.
//!
//! Lock files and concurrency slots record the owning PID; a holder whose PID
//! is gone is treated as dead. Agent runs are spawned in their own process
//! group so the whole tree can be terminated at once.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

/// PID of this process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Returns true if a process with `pid` exists (including ones we may not
/// signal).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

/// Returns true while any process remains in group `pgid`.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(-raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

/// Terminate every process in group `pgid`: SIGTERM, then SIGKILL after
/// `grace` if anything is left.
#[cfg(unix)]
pub fn terminate_group(pgid: u32, grace: Duration) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pgid).map_err(|_| anyhow::anyhow!("pgid {pgid} out of range"))?;
    if raw <= 0 {
        return Err(anyhow::anyhow!("refusing to signal process group {raw}"));
    }
    let group = Pid::from_raw(raw);

    debug!(pgid, "sending SIGTERM to process group");
    match killpg(group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(()),
        Err(err) => return Err(anyhow::anyhow!("SIGTERM process group {pgid}: {err}")),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }

    warn!(pgid, "process group survived SIGTERM, sending SIGKILL");
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow::anyhow!("SIGKILL process group {pgid}: {err}")),
    }
}

#[cfg(not(unix))]
pub fn terminate_group(_pgid: u32, _grace: Duration) -> Result<()> {
    Ok(())
}
