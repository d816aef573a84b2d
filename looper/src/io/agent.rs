//! Agent abstraction for iteration and validator runs.
//!
//! The [`Agent`] trait decouples the loop controller from the agent CLI.
//! Tests use scripted agents that return predetermined output without
//! spawning processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::config::SandboxConfig;
use crate::io::interrupt::InterruptFlag;
use crate::io::mcp::McpConfig;
use crate::io::process::{WatchOptions, run_watched};
use crate::io::sandbox::{
    AgentKind, EffectiveSandbox, SpawnInputs, build_spawn_spec, kill_labeled_containers,
};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session: String,
    pub model: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub writable_paths: Vec<PathBuf>,
    pub sandbox: EffectiveSandbox,
    /// Raw stdout/stderr are tee'd here as they arrive.
    pub log_path: PathBuf,
    pub watch: WatchOptions,
}

/// What the controller needs from a finished invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub exit_code: Option<i32>,
    /// Captured stdout followed by stderr, lossily decoded.
    pub output: String,
    /// Captured stdout alone. Only this stream carries agent events.
    pub stdout: String,
    pub output_bytes: u64,
    pub duration: Duration,
    pub stalled: bool,
    pub interrupted: bool,
}

/// Abstraction over agent backends.
pub trait Agent {
    fn kind(&self) -> AgentKind;

    /// Run to exit, stall, or interrupt. Errors are reserved for failures to
    /// launch or observe the child; a non-zero exit is a normal [`AgentRun`].
    fn run(&self, request: &AgentRequest, interrupt: &InterruptFlag) -> Result<AgentRun>;
}

/// Agent that spawns the configured CLI under the resolved sandbox.
pub struct ProcessAgent {
    kind: AgentKind,
    program: String,
    mcp: Option<McpConfig>,
    sandbox: SandboxConfig,
}

impl ProcessAgent {
    pub fn new(
        kind: AgentKind,
        program: impl Into<String>,
        mcp: Option<McpConfig>,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            kind,
            program: program.into(),
            mcp,
            sandbox,
        }
    }
}

impl Agent for ProcessAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    #[instrument(skip_all, fields(agent = self.kind.as_str(), model = %request.model, sandbox = %request.sandbox))]
    fn run(&self, request: &AgentRequest, interrupt: &InterruptFlag) -> Result<AgentRun> {
        let spec = build_spawn_spec(&SpawnInputs {
            agent: self.kind,
            program: &self.program,
            model: &request.model,
            sandbox: request.sandbox,
            workdir: &request.workdir,
            writable_paths: &request.writable_paths,
            mcp: self.mcp.as_ref(),
            container: &self.sandbox,
            session: &request.session,
        })?;
        info!(program = %spec.program, "starting agent");

        let watched = run_watched(
            spec.command(),
            request.prompt.as_bytes(),
            &request.watch,
            &request.log_path,
            interrupt,
        )
        .with_context(|| format!("run {} agent", self.kind.as_str()))?;

        if !watched.status.success() && !watched.stalled && !watched.interrupted {
            warn!(exit_code = ?watched.status.code(), "agent exited non-zero");
        }

        // Killing the runtime client leaves the daemon-owned container running.
        if let Some(label) = &spec.container_label
            && (watched.stalled || watched.interrupted)
        {
            let timeout = Duration::from_secs(self.sandbox.probe_timeout_secs.max(1) * 2);
            let killed = kill_labeled_containers(&self.sandbox.container_runtime, label, timeout)
                .with_context(|| format!("kill containers labeled {label}"))?;
            info!(killed, stalled = watched.stalled, "stopped iteration containers");
        }

        let stdout = String::from_utf8_lossy(&watched.stdout).into_owned();
        let mut output = stdout.clone();
        if !watched.stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&String::from_utf8_lossy(&watched.stderr));
        }
        Ok(AgentRun {
            exit_code: watched.status.code(),
            output,
            stdout,
            output_bytes: watched.output_bytes,
            duration: watched.duration,
            stalled: watched.stalled,
            interrupted: watched.interrupted,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn request(temp: &std::path::Path) -> AgentRequest {
        AgentRequest {
            session: "calm-river-fox-0a1b".to_string(),
            model: "m1".to_string(),
            prompt: "hello from stdin".to_string(),
            workdir: temp.to_path_buf(),
            writable_paths: Vec::new(),
            sandbox: EffectiveSandbox::None,
            log_path: temp.join("logs/iteration-1.log"),
            watch: WatchOptions {
                stall_timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(20),
                kill_grace: Duration::from_millis(200),
                ..WatchOptions::default()
            },
        }
    }

    #[test]
    fn process_agent_runs_program_and_collects_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-agent.sh");
        write_script(
            &script,
            "#!/bin/sh\ncat >/dev/null\necho \"model=$3\"\necho oops >&2\nexit 4\n",
        );

        let agent = ProcessAgent::new(
            AgentKind::Claude,
            script.to_string_lossy(),
            None,
            SandboxConfig::default(),
        );
        let req = request(temp.path());
        let run = agent.run(&req, &InterruptFlag::new()).expect("run");

        assert_eq!(run.exit_code, Some(4));
        assert!(run.output.contains("model=m1"), "output: {}", run.output);
        assert!(run.output.contains("oops"));
        assert!(!run.stdout.contains("oops"));
        assert!(!run.stalled);
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("model=m1"));
    }

    fn write_script(path: &std::path::Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, body).expect("write script");
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[test]
    fn stalled_container_run_kills_labeled_containers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().display().to_string();
        let runtime = temp.path().join("fake-runtime.sh");
        // `run` leaves a detached process behind, standing in for the daemon's container.
        write_script(
            &runtime,
            &format!(
                r#"#!/bin/sh
echo "$1" >> "{dir}/calls"
case "$1" in
  run)
    cat >/dev/null
    setsid sh -c 'echo $$ > "{dir}/container.pid"; exec sleep 60' </dev/null >/dev/null 2>&1 &
    sleep 30
    ;;
  ps)
    if [ -f "{dir}/container.pid" ] && kill -0 "$(cat "{dir}/container.pid")" 2>/dev/null; then
      echo c0ffee
    fi
    ;;
  kill)
    kill "$(cat "{dir}/container.pid")"
    ;;
esac
"#
            ),
        );

        let sandbox = SandboxConfig {
            container_runtime: runtime.to_string_lossy().into_owned(),
            probe_timeout_secs: 2,
            ..SandboxConfig::default()
        };
        let agent = ProcessAgent::new(AgentKind::Claude, "claude", None, sandbox);
        let mut req = request(temp.path());
        req.sandbox = EffectiveSandbox::Container;
        req.watch.stall_timeout = Duration::from_secs(1);
        let run = agent.run(&req, &InterruptFlag::new()).expect("run");

        assert!(run.stalled);
        let calls = fs::read_to_string(temp.path().join("calls")).expect("calls");
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls, ["run", "ps", "kill"]);
    }

    #[test]
    fn marker_on_stderr_stays_out_of_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("echoing-agent.sh");
        write_script(
            &script,
            r#"#!/bin/sh
cat >&2
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"still working"}]}}'
"#,
        );
        let agent = ProcessAgent::new(
            AgentKind::Claude,
            script.to_string_lossy(),
            None,
            SandboxConfig::default(),
        );
        let mut req = request(temp.path());
        req.prompt = "finish with <promise>COMPLETE</promise>".to_string();
        let run = agent.run(&req, &InterruptFlag::new()).expect("run");

        assert_eq!(run.exit_code, Some(0));
        assert!(run.output.contains("<promise>COMPLETE</promise>"));
        let transcript = crate::core::events::parse_transcript(&run.stdout);
        assert_eq!(transcript.joined_text(), "still working");
        assert!(!crate::core::completion::contains_marker(
            &transcript.joined_text(),
            "COMPLETE"
        ));
    }
}
