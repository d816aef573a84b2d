//! Looper configuration stored under `<state root>/looper.toml`.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::Backoff;
use crate::core::budget::DEFAULT_WARN_FRACTION;
use crate::core::classifier::CrashThresholds;
use crate::core::rate_limit::{DEFAULT_RATE_LIMIT_PATTERNS, RateLimitDetector};
use crate::core::selector::TierModels;
use crate::io::lock::LockOptions;
use crate::io::process::WatchOptions;
use crate::io::sandbox::SandboxMode;

/// Environment variable overriding the state root.
pub const HOME_ENV: &str = "LOOPER_HOME";
pub const CONFIG_FILE: &str = "looper.toml";

/// Looper configuration (TOML).
///
/// Edited by humans; every field is optional and missing fields take the
/// defaults below. CLI flags override these per invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LooperConfig {
    pub models: TierModels,
    pub concurrency: ConcurrencyConfig,
    pub cooldowns: CooldownConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(rename = "loop")]
    pub looping: LoopConfig,
    pub lock: LockConfig,
    pub sandbox: SandboxConfig,
    pub agents: AgentCommands,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Limit for models without an override.
    pub default_limit: usize,
    /// Per-model overrides, e.g. `opus = 1`.
    pub per_model: BTreeMap<String, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_limit: 2,
            per_model: BTreeMap::new(),
        }
    }
}

impl ConcurrencyConfig {
    pub fn limit_for(&self, model: &str) -> usize {
        self.per_model
            .get(model)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CooldownConfig {
    /// Cooldown after a rate-limit pattern match.
    pub default_secs: u64,
    /// Cooldown after a stall kill.
    pub stall_secs: u64,
    /// Cooldown after a suspected crash or soft limit.
    pub crash_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_secs: 15 * 60,
            stall_secs: 120,
            crash_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Case-insensitive regexes, checked in order.
    pub patterns: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_RATE_LIMIT_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Kill an attempt whose output has not grown for this long.
    pub stall_timeout_secs: u64,
    /// Watchdog poll interval.
    pub poll_interval_ms: u64,
    /// Wipe notes and struggle counters every k iterations (0 disables).
    pub state_reset_interval: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Iterations shorter than this count as "short".
    pub short_iteration_secs: u64,
    /// Suspected crash: output below this many bytes...
    pub crash_output_bytes: u64,
    /// ...and duration below this many seconds.
    pub crash_duration_secs: u64,
    /// Same-iteration retries before the attempt is consumed anyway.
    pub max_retries_per_iteration: u32,
    pub budget_warn_fraction: f64,
    /// SIGTERM to SIGKILL grace when terminating a process group.
    pub kill_grace_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 600,
            poll_interval_ms: 1_000,
            state_reset_interval: 5,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            short_iteration_secs: 30,
            crash_output_bytes: 100,
            crash_duration_secs: 10,
            max_retries_per_iteration: 5,
            budget_warn_fraction: DEFAULT_WARN_FRACTION,
            kill_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub stale_secs: u64,
    pub timeout_secs: u64,
    /// An active session untouched this long may be taken over even if its
    /// owner PID is alive.
    pub session_stale_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_secs: 300,
            timeout_secs: 30,
            session_stale_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub mode: SandboxMode,
    /// Container CLI (`docker`, `podman`).
    pub container_runtime: String,
    pub container_image: String,
    /// Host environment variables forwarded into sandboxed runs.
    pub env_passthrough: Vec<String>,
    /// Bound on tool probes such as `docker info`.
    pub probe_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Auto,
            container_runtime: "docker".to_string(),
            container_image: "looper-agent:latest".to_string(),
            env_passthrough: vec![
                "ANTHROPIC_API_KEY".to_string(),
                "OPENAI_API_KEY".to_string(),
            ],
            probe_timeout_secs: 5,
        }
    }
}

/// Executables used for each agent kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentCommands {
    pub claude: String,
    pub codex: String,
}

impl Default for AgentCommands {
    fn default() -> Self {
        Self {
            claude: "claude".to_string(),
            codex: "codex".to_string(),
        }
    }
}

impl LooperConfig {
    pub fn validate(&self) -> Result<()> {
        if self.models.high.is_empty() && self.models.medium.is_empty() && self.models.low.is_empty()
        {
            return Err(anyhow!("models: at least one tier must list a model"));
        }
        if self.concurrency.default_limit == 0 {
            return Err(anyhow!("concurrency.default_limit must be > 0"));
        }
        if self.looping.stall_timeout_secs == 0 {
            return Err(anyhow!("loop.stall_timeout_secs must be > 0"));
        }
        if self.looping.poll_interval_ms == 0 {
            return Err(anyhow!("loop.poll_interval_ms must be > 0"));
        }
        if self.looping.backoff_max_secs < self.looping.backoff_base_secs {
            return Err(anyhow!("loop.backoff_max_secs must be >= loop.backoff_base_secs"));
        }
        let fraction = self.looping.budget_warn_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(anyhow!("loop.budget_warn_fraction must be in (0, 1]"));
        }
        if self.lock.stale_secs == 0 || self.lock.timeout_secs == 0 {
            return Err(anyhow!("lock.stale_secs and lock.timeout_secs must be > 0"));
        }
        if self.lock.session_stale_secs < self.looping.stall_timeout_secs {
            return Err(anyhow!(
                "lock.session_stale_secs must be at least loop.stall_timeout_secs"
            ));
        }
        if self.sandbox.container_runtime.trim().is_empty() {
            return Err(anyhow!("sandbox.container_runtime must be non-empty"));
        }
        if self.agents.claude.trim().is_empty() || self.agents.codex.trim().is_empty() {
            return Err(anyhow!("agents commands must be non-empty"));
        }
        RateLimitDetector::new(&self.rate_limit.patterns)?;
        Ok(())
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(self.lock.stale_secs),
            timeout: Duration::from_secs(self.lock.timeout_secs),
            ..LockOptions::default()
        }
    }

    pub fn session_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock.session_stale_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_secs(self.looping.backoff_base_secs),
            max: Duration::from_secs(self.looping.backoff_max_secs),
        }
    }

    pub fn crash_thresholds(&self) -> CrashThresholds {
        CrashThresholds {
            max_output_bytes: self.looping.crash_output_bytes,
            max_duration: Duration::from_secs(self.looping.crash_duration_secs),
        }
    }

    pub fn short_iteration(&self) -> Duration {
        Duration::from_secs(self.looping.short_iteration_secs)
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            stall_timeout: Duration::from_secs(self.looping.stall_timeout_secs),
            poll_interval: Duration::from_millis(self.looping.poll_interval_ms),
            kill_grace: Duration::from_secs(self.looping.kill_grace_secs),
            ..WatchOptions::default()
        }
    }
}

/// Resolve the state root: `$LOOPER_HOME`, else `~/.looper`.
pub fn default_state_root() -> Result<PathBuf> {
    if let Some(home) = env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(home.join(".looper"))
}

pub fn config_path(state_root: &Path) -> PathBuf {
    state_root.join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LooperConfig::default()`.
pub fn load_config(path: &Path) -> Result<LooperConfig> {
    if !path.exists() {
        let cfg = LooperConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LooperConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LooperConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
