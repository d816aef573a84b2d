//! Data-driven rate-limit detection over raw agent output.

use anyhow::{Context, Result};
use regex::Regex;

/// Patterns used when the config does not override them.
///
/// Matched case-insensitively, in order.
pub const DEFAULT_RATE_LIMIT_PATTERNS: &[&str] = &[
    r"\b429\b",
    r"rate[ _-]?limit",
    r"too many requests",
    r"ThrottlingException",
    r"RESOURCE_EXHAUSTED",
    r"overloaded_error",
    r"quota (?:exceeded|exhausted)",
    r"usage limit reached",
];

/// Ordered list of compiled matchers.
#[derive(Debug, Clone)]
pub struct RateLimitDetector {
    patterns: Vec<(String, Regex)>,
}

impl RateLimitDetector {
    /// Compile `patterns` (case-insensitive). Fails on the first invalid regex.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                let regex = Regex::new(&format!("(?i){pattern}"))
                    .with_context(|| format!("compile rate limit pattern '{pattern}'"))?;
                Ok((pattern.to_string(), regex))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Return the first pattern (in configured order) that matches `output`.
    pub fn detect(&self, output: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(output))
            .map(|(pattern, _)| pattern.as_str())
    }
}
