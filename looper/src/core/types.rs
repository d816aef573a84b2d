//! Shared deterministic types for looper core logic.
//!
//! These types define stable contracts between the controller and the
//! persisted session layout. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default completion marker text (`<promise>COMPLETE</promise>`).
pub const DEFAULT_MARKER_TEXT: &str = "COMPLETE";

/// Hard ceiling on iterations per session, applied even when the caller asks
/// for unlimited iterations.
pub const ABSOLUTE_MAX_ITERATIONS: u32 = 1_000;

/// Ordered priority class of backend models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl Tier {
    /// Next tier down the fallback chain (`high -> medium -> low`).
    pub fn lower(self) -> Option<Tier> {
        match self {
            Tier::High => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Low),
            Tier::Low => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Tier::High),
            "medium" => Ok(Tier::Medium),
            "low" => Ok(Tier::Low),
            other => Err(format!("unknown tier '{other}' (expected high|medium|low)")),
        }
    }
}

/// How a claimed completion is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// The marker alone ends the loop.
    #[default]
    Marker,
    /// A second, independent agent run must confirm the marker.
    Validate,
}

impl FromStr for CompletionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "marker" => Ok(CompletionMode::Marker),
            "validate" => Ok(CompletionMode::Validate),
            other => Err(format!(
                "unknown completion mode '{other}' (expected marker|validate)"
            )),
        }
    }
}

/// Persisted per-session state (`sessions/<id>/state.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionState {
    pub id: String,
    pub task: String,
    pub workdir: String,
    pub active: bool,
    /// PID of the loop process currently holding the session.
    pub owner_pid: Option<u32>,
    /// Last consumed iteration number (0 before the first iteration).
    pub iteration: u32,
    pub model: Option<String>,
    pub tier: Tier,
    pub min_iterations: u32,
    /// 0 means unlimited (still bounded by [`ABSOLUTE_MAX_ITERATIONS`]).
    pub max_iterations: u32,
    pub marker_text: String,
    pub completion_mode: CompletionMode,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
    /// Same-iteration retries spent on the current iteration number.
    pub retries: u32,
    pub last_stop: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            id: String::new(),
            task: String::new(),
            workdir: String::new(),
            active: false,
            owner_pid: None,
            iteration: 0,
            model: None,
            tier: Tier::High,
            min_iterations: 1,
            max_iterations: 0,
            marker_text: DEFAULT_MARKER_TEXT.to_string(),
            completion_mode: CompletionMode::Marker,
            started_at: None,
            updated_at: None,
            retries: 0,
            last_stop: None,
        }
    }
}

impl SessionState {
    /// Effective iteration ceiling: the configured maximum, clamped to the
    /// absolute safety bound.
    pub fn iteration_ceiling(&self) -> u32 {
        if self.max_iterations == 0 {
            ABSOLUTE_MAX_ITERATIONS
        } else {
            self.max_iterations.min(ABSOLUTE_MAX_ITERATIONS)
        }
    }
}

/// One consumed attempt. Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationRecord {
    pub iteration: u32,
    pub model: String,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub completion_detected: bool,
    pub changed_files: Vec<String>,
    pub cost: Option<f64>,
    pub started_at: Option<String>,
}

/// Running non-progress counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StruggleIndicators {
    pub consecutive_no_changes: u32,
    pub consecutive_short: u32,
}

/// Append-only iteration history plus the struggle counters derived from it
/// (`sessions/<id>/history.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IterationHistory {
    pub records: Vec<IterationRecord>,
    pub struggle: StruggleIndicators,
}

/// Reason the controller stopped without a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// Completion confirmed at or after the minimum iteration floor.
    Completed { iteration: u32 },
    /// Cumulative spend reached the limit after an iteration was billed.
    BudgetExceeded { spent: f64, limit: f64 },
    /// The iteration ceiling was reached without confirmed completion.
    MaxIterations { iterations: u32, limit: u32, absolute: bool },
    /// An external interrupt stopped the loop.
    Interrupted { iteration: u32 },
}

impl fmt::Display for LoopStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStop::Completed { iteration } => {
                write!(f, "completed at iteration {iteration}")
            }
            LoopStop::BudgetExceeded { spent, limit } => {
                write!(f, "budget exceeded: spent ${spent:.2} of ${limit:.2} limit")
            }
            LoopStop::MaxIterations {
                iterations,
                limit,
                absolute,
            } => {
                if *absolute {
                    write!(
                        f,
                        "reached absolute iteration ceiling ({iterations}/{limit}) without completion"
                    )
                } else {
                    write!(
                        f,
                        "reached max iterations ({iterations}/{limit}) without completion"
                    )
                }
            }
            LoopStop::Interrupted { iteration } => {
                write!(f, "interrupted during iteration {iteration}")
            }
        }
    }
}
