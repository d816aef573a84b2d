//! Structured view of the agent's line-oriented event stream.
//!
//! The controller treats agent stdout as opaque bytes for stall detection.
//! This module extracts the two things it needs structurally: assistant text
//! (for completion-marker search) and the final cost figure. Lines that are
//! not JSON are treated as plain text so non-streaming agents still work.

use serde_json::Value;

/// Parsed view of one agent run's stdout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentTranscript {
    /// Assistant-authored text, one entry per message/result.
    pub text: Vec<String>,
    /// Total cost reported by the final event, if any.
    pub cost: Option<f64>,
    /// Duration reported by the final event, if any.
    pub duration_ms: Option<u64>,
}

impl AgentTranscript {
    pub fn joined_text(&self) -> String {
        self.text.join("\n")
    }
}

/// Parse an agent event stream.
///
/// Recognizes Claude `stream-json` (`assistant` messages and the final
/// `result` event carrying `total_cost_usd`) and Codex `--json`
/// (`item.completed` agent messages). Unknown JSON events are ignored.
pub fn parse_transcript(output: &str) -> AgentTranscript {
    let mut transcript = AgentTranscript::default();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                transcript.text.push(line.to_string());
                continue;
            }
        };
        absorb_event(&value, &mut transcript);
    }
    transcript
}

fn absorb_event(event: &Value, transcript: &mut AgentTranscript) {
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let blocks = event
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text")
                    && let Some(text) = block.get("text").and_then(Value::as_str)
                {
                    transcript.text.push(text.to_string());
                }
            }
        }
        Some("result") => {
            if let Some(text) = event.get("result").and_then(Value::as_str) {
                transcript.text.push(text.to_string());
            }
            if let Some(cost) = event
                .get("total_cost_usd")
                .or_else(|| event.get("cost_usd"))
                .and_then(Value::as_f64)
            {
                transcript.cost = Some(cost);
            }
            if let Some(ms) = event.get("duration_ms").and_then(Value::as_u64) {
                transcript.duration_ms = Some(ms);
            }
        }
        Some("item.completed") => {
            let item = event.get("item");
            let kind = item.and_then(|i| i.get("type")).and_then(Value::as_str);
            if matches!(kind, Some("agent_message" | "assistant_message"))
                && let Some(text) = item.and_then(|i| i.get("text")).and_then(Value::as_str)
            {
                transcript.text.push(text.to_string());
            }
        }
        _ => {
            if let Some(cost) = event.get("total_cost_usd").and_then(Value::as_f64) {
                transcript.cost = Some(cost);
            }
        }
    }
}
