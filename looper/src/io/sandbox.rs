//! Sandbox selection and spawn specs for agent runs.
//!
//! Resolution is data selection: the requested mode plus what the host
//! offers (probed through [`Probe`]) yields one [`EffectiveSandbox`] and the
//! warnings explaining any downgrade. [`build_spawn_spec`] then renders the
//! full command line for that variant.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::io::config::SandboxConfig;
use crate::io::mcp::McpConfig;
use crate::io::process::run_command_with_timeout;

/// Restricted-syscall sandbox tool looked up on `PATH`.
pub const RESTRICTED_TOOL: &str = "bwrap";
/// Container label carrying the session id.
pub const CONTAINER_LABEL_KEY: &str = "looper.session";

/// Requested isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    None,
    Container,
    Restricted,
    #[default]
    Auto,
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SandboxMode::None),
            "container" => Ok(SandboxMode::Container),
            "restricted" => Ok(SandboxMode::Restricted),
            "auto" => Ok(SandboxMode::Auto),
            other => Err(format!(
                "unknown sandbox mode '{other}' (expected auto|none|container|restricted)"
            )),
        }
    }
}

/// Isolation actually used for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveSandbox {
    None,
    Container,
    Restricted,
    /// The agent CLI's own sandbox.
    Native,
}

impl fmt::Display for EffectiveSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EffectiveSandbox::None => "none",
            EffectiveSandbox::Container => "container",
            EffectiveSandbox::Restricted => "restricted",
            EffectiveSandbox::Native => "native",
        })
    }
}

/// Agent CLI family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Claude,
    Codex,
}

impl AgentKind {
    /// Whether the CLI can confine itself to the working directory.
    pub fn has_native_sandbox(self) -> bool {
        matches!(self, AgentKind::Codex)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "codex" => Ok(AgentKind::Codex),
            other => Err(format!("unknown agent '{other}' (expected claude|codex)")),
        }
    }
}

/// Host capability checks.
pub trait Probe {
    fn restricted_tool_available(&self) -> bool;
    fn container_runtime_available(&self) -> bool;
}

/// Probes the real host: `bwrap` on `PATH`, container runtime answering
/// `<runtime> info` within the probe timeout.
pub struct SystemProbe {
    runtime: String,
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(cfg: &SandboxConfig) -> Self {
        Self {
            runtime: cfg.container_runtime.clone(),
            timeout: Duration::from_secs(cfg.probe_timeout_secs),
        }
    }
}

impl Probe for SystemProbe {
    fn restricted_tool_available(&self) -> bool {
        which::which(RESTRICTED_TOOL).is_ok()
    }

    fn container_runtime_available(&self) -> bool {
        if which::which(&self.runtime).is_err() {
            return false;
        }
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("info");
        match run_command_with_timeout(cmd, self.timeout) {
            Ok(out) => out.success(),
            Err(err) => {
                debug!(runtime = %self.runtime, err = %err, "container runtime probe failed");
                false
            }
        }
    }
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub mode: EffectiveSandbox,
    pub warnings: Vec<String>,
}

/// Pick the effective sandbox. Preference order: native > restricted >
/// container > none. Explicit requests that cannot be honoured fall down the
/// same order with a warning.
pub fn resolve(requested: SandboxMode, agent: AgentKind, probe: &dyn Probe) -> Resolution {
    let mut warnings = Vec::new();
    let mode = match requested {
        SandboxMode::None => EffectiveSandbox::None,
        SandboxMode::Auto => {
            if agent.has_native_sandbox() {
                EffectiveSandbox::Native
            } else if probe.restricted_tool_available() {
                EffectiveSandbox::Restricted
            } else if probe.container_runtime_available() {
                EffectiveSandbox::Container
            } else {
                warnings.push(format!(
                    "no sandbox available ({RESTRICTED_TOOL} not on PATH, container runtime unreachable); running {} unconfined",
                    agent.as_str()
                ));
                EffectiveSandbox::None
            }
        }
        SandboxMode::Restricted => {
            if probe.restricted_tool_available() {
                EffectiveSandbox::Restricted
            } else if probe.container_runtime_available() {
                warnings.push(format!(
                    "restricted sandbox requested but {RESTRICTED_TOOL} is not on PATH; using container"
                ));
                EffectiveSandbox::Container
            } else {
                warnings.push(format!(
                    "restricted sandbox requested but {RESTRICTED_TOOL} is not on PATH and no container runtime is reachable; running unconfined"
                ));
                EffectiveSandbox::None
            }
        }
        SandboxMode::Container => {
            if probe.container_runtime_available() {
                EffectiveSandbox::Container
            } else {
                warnings.push(
                    "container sandbox requested but the container runtime is unreachable; running unconfined"
                        .to_string(),
                );
                EffectiveSandbox::None
            }
        }
    };
    for warning in &warnings {
        warn!(%warning, "sandbox downgraded");
    }
    Resolution { mode, warnings }
}

/// Everything needed to render a spawn spec.
#[derive(Debug, Clone)]
pub struct SpawnInputs<'a> {
    pub agent: AgentKind,
    /// Agent executable.
    pub program: &'a str,
    pub model: &'a str,
    pub sandbox: EffectiveSandbox,
    pub workdir: &'a Path,
    /// Extra paths the agent may write besides `workdir`.
    pub writable_paths: &'a [PathBuf],
    pub mcp: Option<&'a McpConfig>,
    pub container: &'a SandboxConfig,
    pub session: &'a str,
}

/// A fully rendered child command. The prompt is always fed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: PathBuf,
    /// Label to kill leftover containers by.
    pub container_label: Option<String>,
}

impl SpawnSpec {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(&self.workdir);
        cmd
    }
}

pub fn container_label(session: &str) -> String {
    format!("{CONTAINER_LABEL_KEY}={session}")
}

pub fn build_spawn_spec(inputs: &SpawnInputs<'_>) -> Result<SpawnSpec> {
    if inputs.model.trim().is_empty() {
        bail!("cannot build spawn spec without a model");
    }
    let agent_args = agent_args(inputs);
    let mut env = BTreeMap::new();
    env.insert("LOOPER_SESSION".to_string(), inputs.session.to_string());
    let workdir = inputs.workdir.to_path_buf();

    let spec = match inputs.sandbox {
        EffectiveSandbox::None | EffectiveSandbox::Native => SpawnSpec {
            program: inputs.program.to_string(),
            args: agent_args,
            env,
            workdir,
            container_label: None,
        },
        EffectiveSandbox::Restricted => SpawnSpec {
            program: RESTRICTED_TOOL.to_string(),
            args: bwrap_args(inputs, agent_args),
            env,
            workdir,
            container_label: None,
        },
        EffectiveSandbox::Container => {
            let label = container_label(inputs.session);
            SpawnSpec {
                program: inputs.container.container_runtime.clone(),
                args: container_args(inputs, &label, agent_args),
                env,
                workdir,
                container_label: Some(label),
            }
        }
    };
    debug!(program = %spec.program, sandbox = %inputs.sandbox, "spawn spec built");
    Ok(spec)
}

fn agent_args(inputs: &SpawnInputs<'_>) -> Vec<String> {
    let mut args = Vec::new();
    match inputs.agent {
        AgentKind::Claude => {
            args.extend(
                [
                    "-p",
                    "--model",
                    inputs.model,
                    "--output-format",
                    "stream-json",
                    "--verbose",
                    "--dangerously-skip-permissions",
                ]
                .map(String::from),
            );
            for path in inputs.writable_paths {
                args.push("--add-dir".to_string());
                args.push(path.display().to_string());
            }
            if let Some(mcp) = inputs.mcp {
                args.push("--mcp-config".to_string());
                args.push(mcp.path.display().to_string());
            }
        }
        AgentKind::Codex => {
            args.extend(
                ["exec", "--model", inputs.model, "--json", "--skip-git-repo-check"]
                    .map(String::from),
            );
            if inputs.sandbox == EffectiveSandbox::Native {
                args.extend(["--sandbox", "workspace-write"].map(String::from));
                if !inputs.writable_paths.is_empty() {
                    let roots: Vec<String> = inputs
                        .writable_paths
                        .iter()
                        .map(|p| serde_json::Value::String(p.display().to_string()).to_string())
                        .collect();
                    args.push("-c".to_string());
                    args.push(format!(
                        "sandbox_workspace_write.writable_roots=[{}]",
                        roots.join(",")
                    ));
                }
            } else {
                // Confinement, if any, comes from the outer wrapper.
                args.extend(["--sandbox", "danger-full-access"].map(String::from));
            }
            if let Some(mcp) = inputs.mcp {
                args.extend(mcp.codex_overrides());
            }
            args.push("-".to_string());
        }
    }
    args
}

/// Agent state directories under `$HOME` that must stay writable.
fn agent_home_dirs(agent: AgentKind) -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let names: &[&str] = match agent {
        AgentKind::Claude => &[".claude", ".claude.json"],
        AgentKind::Codex => &[".codex"],
    };
    names
        .iter()
        .map(|name| home.join(name))
        .filter(|p| p.exists())
        .collect()
}

fn bwrap_args(inputs: &SpawnInputs<'_>, agent_args: Vec<String>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp",
    ]
    .map(String::from)
    .to_vec();
    let mut writable = vec![inputs.workdir.to_path_buf()];
    writable.extend(inputs.writable_paths.iter().cloned());
    writable.extend(agent_home_dirs(inputs.agent));
    for path in writable {
        let p = path.display().to_string();
        args.extend(["--bind".to_string(), p.clone(), p]);
    }
    args.extend(["--die-with-parent", "--chdir"].map(String::from));
    args.push(inputs.workdir.display().to_string());
    args.push("--".to_string());
    args.push(inputs.program.to_string());
    args.extend(agent_args);
    args
}

fn container_args(inputs: &SpawnInputs<'_>, label: &str, agent_args: Vec<String>) -> Vec<String> {
    let workdir = inputs.workdir.display().to_string();
    let mut args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--label".to_string(),
        label.to_string(),
        "-w".to_string(),
        workdir.clone(),
        "-v".to_string(),
        format!("{workdir}:{workdir}"),
    ];
    for path in inputs.writable_paths {
        let p = path.display().to_string();
        args.push("-v".to_string());
        args.push(format!("{p}:{p}"));
    }
    if let Some(mcp) = inputs.mcp {
        let p = mcp.path.display().to_string();
        args.push("-v".to_string());
        args.push(format!("{p}:{p}:ro"));
    }
    for var in &inputs.container.env_passthrough {
        args.push("-e".to_string());
        args.push(var.clone());
    }
    args.extend(["-e".to_string(), "LOOPER_SESSION".to_string()]);
    args.push(inputs.container.container_image.clone());
    args.push(inputs.program.to_string());
    args.extend(agent_args);
    args
}

/// Kill every container carrying `label`. Returns how many were killed.
pub fn kill_labeled_containers(runtime: &str, label: &str, timeout: Duration) -> Result<usize> {
    let mut ps = Command::new(runtime);
    ps.args(["ps", "-q", "--filter"])
        .arg(format!("label={label}"));
    let listed = run_command_with_timeout(ps, timeout)?;
    if !listed.success() {
        bail!(
            "{runtime} ps failed: {}",
            String::from_utf8_lossy(&listed.stderr).trim()
        );
    }
    let ids: Vec<String> = String::from_utf8_lossy(&listed.stdout)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    let mut kill = Command::new(runtime);
    kill.arg("kill").args(&ids);
    let killed = run_command_with_timeout(kill, timeout)?;
    if !killed.success() {
        bail!(
            "{runtime} kill failed: {}",
            String::from_utf8_lossy(&killed.stderr).trim()
        );
    }
    info!(count = ids.len(), label, "killed leftover containers");
    Ok(ids.len())
}
