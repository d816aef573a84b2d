//! Test-only helpers: a scripted agent and fixture builders.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::core::classifier::CrashThresholds;
use crate::core::selector::TierModels;
use crate::io::agent::{Agent, AgentRequest, AgentRun};
use crate::io::config::LooperConfig;
use crate::io::interrupt::InterruptFlag;
use crate::io::sandbox::{AgentKind, Probe};
use crate::io::store::FileStore;

/// One scripted agent invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStep {
    pub output: String,
    /// Diagnostic stream, appended after `output` in the combined text.
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Overrides the byte count (defaults to `output.len()`).
    pub output_bytes: Option<u64>,
    pub stalled: bool,
    /// Raise the interrupt flag and report the run as interrupted.
    pub interrupt: bool,
    /// Files written relative to the request workdir before returning.
    pub writes: Vec<(String, String)>,
}

impl ScriptedStep {
    /// Clean exit with `output`.
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.stderr = text.into();
        self
    }

    pub fn output_bytes(mut self, bytes: u64) -> Self {
        self.output_bytes = Some(bytes);
        self
    }

    /// Killed by the watchdog: no exit code.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self.exit_code = None;
        self
    }

    pub fn interrupted(mut self) -> Self {
        self.interrupt = true;
        self.exit_code = None;
        self
    }

    pub fn writes(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }
}

/// Agent that replays [`ScriptedStep`]s in order and records every request.
pub struct ScriptedAgent {
    kind: AgentKind,
    steps: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            kind: AgentKind::Claude,
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    pub fn models(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.model).collect()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|steps| steps.len()).unwrap_or_default()
    }
}

impl Agent for ScriptedAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn run(&self, request: &AgentRequest, interrupt: &InterruptFlag) -> Result<AgentRun> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted agent request log poisoned"))?
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .map_err(|_| anyhow!("scripted agent steps poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent ran out of steps"))?;

        for (rel, contents) in &step.writes {
            let path = request.workdir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, &step.output)?;
        if step.interrupt {
            interrupt.raise();
        }

        let combined = format!("{}{}", step.output, step.stderr);
        Ok(AgentRun {
            exit_code: step.exit_code,
            output_bytes: step.output_bytes.unwrap_or(combined.len() as u64),
            output: combined,
            stdout: step.output,
            duration: step.duration,
            stalled: step.stalled,
            interrupted: step.interrupt,
        })
    }
}

/// Probe with fixed answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe {
    pub restricted: bool,
    pub container: bool,
}

impl Probe for FixedProbe {
    fn restricted_tool_available(&self) -> bool {
        self.restricted
    }

    fn container_runtime_available(&self) -> bool {
        self.container
    }
}

/// Claude `stream-json` output: one assistant message and a final result
/// event carrying `cost`.
pub fn claude_output(text: &str, cost: f64) -> String {
    let assistant = json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": text}]}
    });
    let result = json!({
        "type": "result",
        "subtype": "success",
        "result": "",
        "total_cost_usd": cost,
        "duration_ms": 1000
    });
    format!("{assistant}\n{result}\n")
}

/// Thresholds that never flag a scripted run as a suspected crash.
pub fn quiet_crash_thresholds() -> CrashThresholds {
    CrashThresholds {
        max_output_bytes: 0,
        max_duration: Duration::ZERO,
    }
}

/// Config for scripted loops: tiers `high=[A,B] medium=[C] low=[D]`, no
/// backoff sleeps, crash heuristic disabled, fast polling.
pub fn test_config() -> LooperConfig {
    let mut cfg = LooperConfig {
        models: TierModels {
            high: vec!["A".to_string(), "B".to_string()],
            medium: vec!["C".to_string()],
            low: vec!["D".to_string()],
        },
        ..LooperConfig::default()
    };
    cfg.looping.crash_output_bytes = 0;
    cfg.looping.crash_duration_secs = 0;
    cfg.looping.backoff_base_secs = 0;
    cfg.looping.backoff_max_secs = 0;
    cfg.looping.poll_interval_ms = 10;
    cfg.looping.kill_grace_secs = 1;
    cfg.looping.state_reset_interval = 0;
    cfg.lock.timeout_secs = 5;
    cfg
}

/// Temporary state root plus a separate working directory.
pub struct TestEnv {
    temp: TempDir,
}

impl TestEnv {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        fs::create_dir_all(temp.path().join("state"))?;
        fs::create_dir_all(temp.path().join("work"))?;
        Ok(Self { temp })
    }

    pub fn state_root(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn workdir(&self) -> PathBuf {
        self.temp.path().join("work")
    }

    pub fn store(&self, cfg: &LooperConfig) -> FileStore {
        FileStore::new(self.state_root(), cfg.lock_options())
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}
