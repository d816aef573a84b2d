//! CLI tests for the `looper` binary.
//!
//! Each test points `LOOPER_HOME` at a temp dir whose `looper.toml` runs a
//! shell script in place of the agent CLI, then checks the exit code.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use looper::exit_codes;
use looper::io::lock::LockOptions;
use looper::io::session::load_session;
use looper::io::store::FileStore;

struct Home {
    temp: tempfile::TempDir,
}

impl Home {
    /// State root with a config whose claude command runs `body`.
    fn new(body: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-claude.sh");
        fs::write(&script, format!("#!/bin/sh\ncat >/dev/null\n{body}\n")).expect("script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        fs::create_dir_all(temp.path().join("state")).expect("state");
        fs::create_dir_all(temp.path().join("work")).expect("work");
        let config = format!(
            r#"[models]
high = ["m1", "m2"]
medium = []
low = []

[loop]
crash_output_bytes = 0
crash_duration_secs = 0
backoff_base_secs = 0
backoff_max_secs = 0
poll_interval_ms = 20
kill_grace_secs = 1
state_reset_interval = 0

[agents]
claude = "{}"
"#,
            script.display()
        );
        fs::write(temp.path().join("state/looper.toml"), config).expect("config");
        Self { temp }
    }

    fn dir(&self) -> &Path {
        self.temp.path()
    }

    fn workdir(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    fn looper(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_looper"))
            .env("LOOPER_HOME", self.temp.path().join("state"))
            .env("FAKE_DIR", self.temp.path())
            .args(args)
            .output()
            .expect("run looper")
    }

    fn run(&self, extra: &[&str]) -> Output {
        let workdir = self.workdir();
        let workdir = workdir.to_str().expect("utf-8 path");
        let mut args = vec![
            "run",
            "--session",
            "cli-job",
            "--task",
            "write the report",
            "--workdir",
            workdir,
            "--sandbox",
            "none",
        ];
        args.extend_from_slice(extra);
        self.looper(&args)
    }
}

#[test]
fn marker_output_exits_ok_and_releases_session() {
    let home = Home::new("echo 'done <promise>COMPLETE</promise>'");
    let out = home.run(&[]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("completed at iteration 1"));

    let store = FileStore::new(home.dir().join("state"), LockOptions::default());
    let state = load_session(&store, "cli-job").expect("load").expect("exists");
    assert!(!state.active);

    let list = home.looper(&["list"]);
    assert_eq!(list.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&list.stdout).starts_with("cli-job\tidle\titer 1"));
}

#[test]
fn budget_exhaustion_exits_with_budget_code() {
    let home = Home::new(
        r#"echo '{"type":"result","subtype":"success","result":"partial","total_cost_usd":3.0}'"#,
    );
    let out = home.run(&["--budget", "5"]);
    assert_eq!(out.status.code(), Some(exit_codes::BUDGET_EXCEEDED));
    assert!(
        String::from_utf8_lossy(&out.stdout).contains("budget exceeded: spent $6.00 of $5.00 limit")
    );
}

#[test]
fn iteration_ceiling_exits_with_max_iterations_code() {
    let home = Home::new("echo 'still working'");
    let out = home.run(&["--max-iterations", "2"]);
    assert_eq!(out.status.code(), Some(exit_codes::MAX_ITERATIONS));

    let status = home.looper(&["status", "cli-job"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let text = String::from_utf8_lossy(&status.stdout);
    assert!(text.contains("iterations:  2 (min 1, max 2)"), "{text}");
}

#[test]
fn stalled_agent_is_killed_and_the_iteration_retried() {
    let home = Home::new(
        r#"if [ -f "$FAKE_DIR/seen" ]; then
  echo 'recovered <promise>COMPLETE</promise>'
else
  touch "$FAKE_DIR/seen"
  sleep 30
fi"#,
    );
    let out = home.run(&["--stall-timeout", "1"]);
    assert_eq!(
        out.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("iteration 1: m1 no output growth for 1s"), "{stderr}");
    assert!(String::from_utf8_lossy(&out.stdout).contains("completed at iteration 1"));
}

#[test]
fn unknown_session_and_bad_flags_are_fatal() {
    let home = Home::new("true");
    assert_eq!(
        home.looper(&["status", "nope"]).status.code(),
        Some(exit_codes::FATAL)
    );
    assert_eq!(
        home.looper(&["inject", "nope", "hello"]).status.code(),
        Some(exit_codes::FATAL)
    );
    assert_eq!(
        home.looper(&["run", "--tier", "ultra"]).status.code(),
        Some(exit_codes::FATAL)
    );
    assert_eq!(
        home.looper(&["run", "--session", "fresh"]).status.code(),
        Some(exit_codes::FATAL)
    );
}
