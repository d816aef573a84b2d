//! Child process execution: bounded probes and watched agent runs.
//!
//! Agent runs are spawned in their own process group. A watchdog thread polls
//! the byte count of everything the child has written; if it stops growing for
//! the stall timeout, or an interrupt is raised, the whole group is terminated.
//! Output is read concurrently (no pipe deadlocks) and tee'd to a log file.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::interrupt::InterruptFlag;
use crate::io::pid::{group_alive, terminate_group};

/// Captured output of a short, bounded command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
pub fn run_command_with_timeout(mut cmd: Command, timeout: Duration) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn command")?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_all(stdout));
    let stderr_handle = thread::spawn(move || read_all(stderr));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => Some(status),
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
            None
        }
    };

    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).context("read output")?;
    Ok(buf)
}

fn join_reader<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub stall_timeout: Duration,
    pub poll_interval: Duration,
    /// SIGTERM to SIGKILL grace for the process group.
    pub kill_grace: Duration,
    /// Tail of stdout/stderr kept in memory; the log file gets everything.
    pub capture_limit_bytes: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
            capture_limit_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Why the watchdog stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Exited,
    Stalled,
    Interrupted,
}

/// Result of a watched run.
#[derive(Debug)]
pub struct WatchedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Total bytes written by the child on both streams.
    pub output_bytes: u64,
    pub duration: Duration,
    pub stalled: bool,
    pub interrupted: bool,
}

type SharedLog = Arc<Mutex<BufWriter<File>>>;

/// Spawn `cmd` in a fresh process group, feed `stdin`, and watch it.
#[instrument(skip_all, fields(stall_secs = opts.stall_timeout.as_secs(), log = %log_path.display()))]
pub fn run_watched(
    mut cmd: Command,
    stdin: &[u8],
    opts: &WatchOptions,
    log_path: &Path,
    interrupt: &InterruptFlag,
) -> Result<WatchedOutput> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log_file =
        File::create(log_path).with_context(|| format!("create log {}", log_path.display()))?;
    let log: SharedLog = Arc::new(Mutex::new(BufWriter::new(log_file)));

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let started = Instant::now();
    debug!("spawning watched child");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pgid = child.id();

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let input = stdin.to_vec();
    let stdin_handle = thread::spawn(move || {
        // A child that exits without reading its prompt closes the pipe.
        if let Err(err) = child_stdin.write_all(&input) {
            debug!(err = %err, "stdin closed early");
        }
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let bytes = Arc::new(AtomicU64::new(0));
    let limit = opts.capture_limit_bytes;
    let stdout_handle = {
        let (bytes, log) = (Arc::clone(&bytes), Arc::clone(&log));
        thread::spawn(move || read_tee_tail(stdout, limit, &bytes, &log))
    };
    let stderr_handle = {
        let (bytes, log) = (Arc::clone(&bytes), Arc::clone(&log));
        thread::spawn(move || read_tee_tail(stderr, limit, &bytes, &log))
    };

    let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
    let watchdog = {
        let bytes = Arc::clone(&bytes);
        let interrupt = interrupt.clone();
        let opts = *opts;
        thread::spawn(move || watch(pgid, &bytes, &interrupt, &opts, &cancel_rx))
    };

    let status = child.wait().context("wait for child")?;
    drop(cancel_tx);
    let verdict = match watchdog.join() {
        Ok(verdict) => verdict,
        Err(_) => return Err(anyhow!("watchdog thread panicked")),
    };

    // Background children that outlived the leader would hold the pipes open.
    if group_alive(pgid) {
        debug!(pgid, "reaping leftover process group members");
        terminate_group(pgid, opts.kill_grace)?;
    }

    let _ = stdin_handle.join();
    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;
    if let Ok(mut writer) = log.lock()
        && let Err(err) = writer.flush()
    {
        warn!(err = %err, "failed to flush iteration log");
    }

    let duration = started.elapsed();
    let output_bytes = bytes.load(Ordering::SeqCst);
    debug!(exit_code = ?status.code(), ?verdict, output_bytes, "watched child finished");
    Ok(WatchedOutput {
        status,
        stdout,
        stderr,
        output_bytes,
        duration,
        stalled: verdict == Verdict::Stalled,
        interrupted: verdict == Verdict::Interrupted,
    })
}

/// Poll output growth until cancelled, killing the group on stall or
/// interrupt.
fn watch(
    pgid: u32,
    bytes: &AtomicU64,
    interrupt: &InterruptFlag,
    opts: &WatchOptions,
    cancel: &mpsc::Receiver<()>,
) -> Verdict {
    let mut last_seen = bytes.load(Ordering::SeqCst);
    let mut last_growth = Instant::now();
    loop {
        match cancel.recv_timeout(opts.poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Verdict::Exited,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let verdict = if interrupt.is_raised() {
            Verdict::Interrupted
        } else {
            let seen = bytes.load(Ordering::SeqCst);
            if seen != last_seen {
                last_seen = seen;
                last_growth = Instant::now();
            }
            if last_growth.elapsed() < opts.stall_timeout {
                continue;
            }
            warn!(
                pgid,
                stall_secs = opts.stall_timeout.as_secs(),
                "no output growth, terminating process group"
            );
            Verdict::Stalled
        };

        if let Err(err) = terminate_group(pgid, opts.kill_grace) {
            error!(pgid, err = %err, "failed to terminate process group");
        }
        return verdict;
    }
}

/// Read a stream to the end, tee-ing every chunk to `log`, counting bytes,
/// and keeping only the last `limit` bytes in memory.
fn read_tee_tail<R: Read>(
    mut reader: R,
    limit: usize,
    bytes: &AtomicU64,
    log: &SharedLog,
) -> Result<Vec<u8>> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        bytes.fetch_add(n as u64, Ordering::SeqCst);
        if let Ok(mut writer) = log.lock() {
            if let Err(e) = writer.write_all(&chunk[..n]) {
                warn!(err = %e, "failed to write iteration log");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush iteration log");
            }
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > limit {
            let excess = kept.len() - limit;
            kept.drain(..excess);
        }
    }
    Ok(kept)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn fast(stall: Duration) -> WatchOptions {
        WatchOptions {
            stall_timeout: stall,
            poll_interval: Duration::from_millis(20),
            kill_grace: Duration::from_millis(200),
            capture_limit_bytes: 1024,
        }
    }

    #[test]
    fn captures_output_and_tees_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs/iteration-1.log");
        let out = run_watched(
            sh("cat; echo done; echo oops >&2"),
            b"prompt\n",
            &fast(Duration::from_secs(5)),
            &log,
            &InterruptFlag::new(),
        )
        .expect("run");

        assert!(out.status.success());
        assert!(!out.stalled && !out.interrupted);
        assert_eq!(String::from_utf8_lossy(&out.stdout), "prompt\ndone\n");
        assert_eq!(String::from_utf8_lossy(&out.stderr), "oops\n");
        assert_eq!(out.output_bytes, 17);
        let logged = fs::read_to_string(&log).expect("read log");
        assert!(logged.contains("done") && logged.contains("oops"));
    }

    #[test]
    fn silent_child_is_killed_as_stalled_with_its_children() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let out = run_watched(
            sh("echo start; sleep 30 & sleep 30; wait"),
            b"",
            &fast(Duration::from_millis(300)),
            &temp.path().join("stall.log"),
            &InterruptFlag::new(),
        )
        .expect("run");

        assert!(out.stalled);
        assert!(!out.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn growing_output_is_not_a_stall() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_watched(
            sh("for i in 1 2 3 4 5 6; do echo tick; sleep 0.1; done"),
            b"",
            &fast(Duration::from_millis(400)),
            &temp.path().join("ticks.log"),
            &InterruptFlag::new(),
        )
        .expect("run");
        assert!(!out.stalled);
        assert!(out.status.success());
    }

    #[test]
    fn interrupt_terminates_the_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let flag = InterruptFlag::new();
        let remote = flag.clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            remote.raise();
        });
        let out = run_watched(
            sh("sleep 30"),
            b"",
            &fast(Duration::from_secs(60)),
            &temp.path().join("int.log"),
            &flag,
        )
        .expect("run");
        raiser.join().expect("join");
        assert!(out.interrupted);
        assert!(!out.stalled);
    }

    #[test]
    fn keeps_only_the_tail_in_memory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("big.log");
        let out = run_watched(
            sh("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done; echo END"),
            b"",
            &fast(Duration::from_secs(5)),
            &log,
            &InterruptFlag::new(),
        )
        .expect("run");
        assert_eq!(out.stdout.len(), 1024);
        assert!(String::from_utf8_lossy(&out.stdout).ends_with("END\n"));
        assert_eq!(fs::metadata(&log).expect("meta").len(), out.output_bytes);
    }

    #[test]
    fn bounded_command_times_out() {
        let out = run_command_with_timeout(sh("exec sleep 5"), Duration::from_millis(100)).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());

        let out = run_command_with_timeout(sh("echo hi"), Duration::from_secs(5)).expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"hi\n");
    }
}
