//! Completion marker matching.
//!
//! An agent claims completion by emitting `<promise>{TEXT}</promise>`. The
//! match is a verbatim substring search: no case folding, no trimming inside
//! the tag, and an unclosed tag never counts.

/// Render the full marker for `text` (e.g. `<promise>COMPLETE</promise>`).
pub fn marker_for(text: &str) -> String {
    format!("<promise>{text}</promise>")
}

/// Returns true if `output` contains the exact marker for `marker_text`.
pub fn contains_marker(output: &str, marker_text: &str) -> bool {
    if marker_text.is_empty() {
        return false;
    }
    output.contains(&marker_for(marker_text))
}
