//! Spend budget evaluation.

/// Fraction of the limit at which a warning is raised by default.
pub const DEFAULT_WARN_FRACTION: f64 = 0.8;

/// Result of comparing cumulative spend against a limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetStatus {
    Ok,
    /// Spend is at or above the warning threshold; `percent` of the limit used.
    Warning { percent: f64 },
    /// Spend is at or above the limit.
    Exceeded,
}

/// Evaluate `spent` against `limit`.
///
/// `spent >= limit` is always `Exceeded`; `spent >= warn_fraction * limit`
/// is `Warning`. A non-positive limit is treated as already exhausted.
pub fn check_budget(spent: f64, limit: f64, warn_fraction: f64) -> BudgetStatus {
    if limit <= 0.0 || spent >= limit {
        return BudgetStatus::Exceeded;
    }
    if spent >= limit * warn_fraction {
        return BudgetStatus::Warning {
            percent: spent / limit * 100.0,
        };
    }
    BudgetStatus::Ok
}
