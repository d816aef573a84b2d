//! Deterministic classification of a finished agent attempt.

use std::time::Duration;

/// Observable facts about one agent attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFacts {
    pub exit_code: Option<i32>,
    pub stalled: bool,
    pub interrupted: bool,
    /// Total bytes the agent wrote to stdout and stderr.
    pub output_bytes: u64,
    pub duration: Duration,
    /// First rate-limit pattern found in the captured output, if any.
    pub rate_limit_match: Option<String>,
}

/// Thresholds for the suspected crash / soft-limit heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashThresholds {
    /// Output strictly below this many bytes counts as negligible.
    pub max_output_bytes: u64,
    /// Duration strictly below this counts as very short.
    pub max_duration: Duration,
}

/// What happened during an attempt, in controller priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptClass {
    /// An external interrupt killed the attempt.
    Interrupted,
    /// Output stopped growing for longer than the stall timeout.
    Stalled,
    /// Non-zero exit with output matching a rate-limit pattern.
    RateLimited { pattern: String },
    /// Negligible output in a very short time, regardless of exit code.
    SuspectedCrash,
    /// Any other non-zero (or signal) exit.
    Failed { exit_code: Option<i32> },
    /// Exit code 0.
    Clean,
}

impl AttemptClass {
    /// Retry classes re-run the same iteration number on another model.
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            AttemptClass::Stalled | AttemptClass::RateLimited { .. } | AttemptClass::SuspectedCrash
        )
    }
}

/// Classify an attempt. Earlier rules win.
pub fn classify_attempt(facts: &AttemptFacts, crash: &CrashThresholds) -> AttemptClass {
    if facts.interrupted {
        return AttemptClass::Interrupted;
    }
    if facts.stalled {
        return AttemptClass::Stalled;
    }
    let success = facts.exit_code == Some(0);
    if !success && let Some(pattern) = &facts.rate_limit_match {
        return AttemptClass::RateLimited {
            pattern: pattern.clone(),
        };
    }
    if facts.output_bytes < crash.max_output_bytes && facts.duration < crash.max_duration {
        return AttemptClass::SuspectedCrash;
    }
    if !success {
        return AttemptClass::Failed {
            exit_code: facts.exit_code,
        };
    }
    AttemptClass::Clean
}
