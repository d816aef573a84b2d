//! Struggle counters and the periodic fresh-eyes reset schedule.

use std::time::Duration;

use crate::core::types::{IterationHistory, IterationRecord, StruggleIndicators};

/// Consecutive no-change iterations before the prompt nudges the agent.
pub const NO_CHANGE_HINT_AFTER: u32 = 3;
/// Consecutive short iterations before the prompt nudges the agent.
pub const SHORT_HINT_AFTER: u32 = 3;

/// Counters after observing one more record. Each counter increments while
/// its condition holds and resets to zero otherwise.
pub fn next_indicators(
    prev: StruggleIndicators,
    record: &IterationRecord,
    short_threshold: Duration,
) -> StruggleIndicators {
    let no_changes = record.changed_files.is_empty();
    let short = Duration::from_millis(record.duration_ms) < short_threshold;
    StruggleIndicators {
        consecutive_no_changes: if no_changes {
            prev.consecutive_no_changes.saturating_add(1)
        } else {
            0
        },
        consecutive_short: if short {
            prev.consecutive_short.saturating_add(1)
        } else {
            0
        },
    }
}

/// Append `record` and update the counters in one step.
pub fn append_record(
    history: &mut IterationHistory,
    record: IterationRecord,
    short_threshold: Duration,
) {
    history.struggle = next_indicators(history.struggle, &record, short_threshold);
    history.records.push(record);
}

/// True when scratch notes and struggle counters are wiped before running
/// `iteration`: iterations `k+1, 2k+1, ...`. `interval == 0` disables resets.
pub fn is_reset_iteration(iteration: u32, interval: u32) -> bool {
    interval > 0 && iteration > 1 && (iteration - 1) % interval == 0
}

/// Human-readable nudges for the next prompt, empty when not struggling.
pub fn struggle_hints(indicators: &StruggleIndicators) -> Vec<String> {
    let mut hints = Vec::new();
    if indicators.consecutive_no_changes >= NO_CHANGE_HINT_AFTER {
        hints.push(format!(
            "The last {} iterations changed no files. Step back and try a different approach.",
            indicators.consecutive_no_changes
        ));
    }
    if indicators.consecutive_short >= SHORT_HINT_AFTER {
        hints.push(format!(
            "The last {} iterations ended very quickly. Make concrete progress before stopping.",
            indicators.consecutive_short
        ));
    }
    hints
}
