//! Stable exit codes for looper CLI commands.

use crate::core::types::LoopStop;

/// Command succeeded, or the loop completed at or after its minimum floor.
pub const OK: i32 = 0;
/// Fatal error: invalid arguments/config, no model in any tier, lock timeout.
pub const FATAL: i32 = 1;
/// Recorded spend reached the session budget.
pub const BUDGET_EXCEEDED: i32 = 2;
/// The iteration ceiling was reached without confirmed completion.
pub const MAX_ITERATIONS: i32 = 3;
/// Stopped by SIGINT/SIGTERM (128 + SIGINT).
pub const INTERRUPTED: i32 = 130;

pub fn for_stop(stop: &LoopStop) -> i32 {
    match stop {
        LoopStop::Completed { .. } => OK,
        LoopStop::BudgetExceeded { .. } => BUDGET_EXCEEDED,
        LoopStop::MaxIterations { .. } => MAX_ITERATIONS,
        LoopStop::Interrupted { .. } => INTERRUPTED,
    }
}
