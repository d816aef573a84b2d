//! Validator pass: an independent agent run that must confirm a claimed
//! completion.
//!
//! The validator sees only the original task and the working agent's notes.
//! A validator that cannot run is reported as [`ValidationOutcome::Skipped`],
//! never as confirmation.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::classifier::{AttemptClass, AttemptFacts, CrashThresholds, classify_attempt};
use crate::core::completion::contains_marker;
use crate::core::events::parse_transcript;
use crate::core::rate_limit::RateLimitDetector;
use crate::core::types::SessionState;
use crate::io::agent::{Agent, AgentRequest};
use crate::io::context::read_notes;
use crate::io::interrupt::InterruptFlag;
use crate::io::iteration_log::{AttemptMeta, AttemptPaths};
use crate::io::process::WatchOptions;
use crate::io::prompt::{PromptEngine, ValidatorPrompt};
use crate::io::sandbox::EffectiveSandbox;
use crate::io::session::SessionPaths;

/// Feedback handed to the next iteration is capped to its tail.
const FEEDBACK_LIMIT_CHARS: usize = 4_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Confirmed,
    Rejected { feedback: String },
    Skipped { reason: String },
}

/// Outcome plus what the run cost and how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub model: Option<String>,
    pub cost: Option<f64>,
    /// Classification of the validator run, `None` if it never started.
    pub class: Option<AttemptClass>,
}

impl ValidationReport {
    fn skipped(reason: impl Into<String>, model: Option<String>) -> Self {
        Self {
            outcome: ValidationOutcome::Skipped {
                reason: reason.into(),
            },
            model,
            cost: None,
            class: None,
        }
    }
}

/// Inputs for one validator pass.
#[derive(Debug, Clone)]
pub struct ValidatorRequest<'a> {
    pub state: &'a SessionState,
    pub paths: &'a SessionPaths,
    pub iteration: u32,
    /// `None` when the registry had no model to offer.
    pub model: Option<String>,
    pub sandbox: EffectiveSandbox,
    pub writable_paths: &'a [PathBuf],
    pub watch: WatchOptions,
}

/// Run the validator and interpret its verdict.
#[instrument(skip_all, fields(session = %request.state.id, iteration = request.iteration))]
pub fn run_validator<A: Agent>(
    agent: &A,
    prompts: &PromptEngine,
    detector: &RateLimitDetector,
    crash: &CrashThresholds,
    request: &ValidatorRequest<'_>,
    interrupt: &InterruptFlag,
) -> Result<ValidationReport> {
    let Some(model) = request.model.clone() else {
        warn!("no model available for validation");
        return Ok(ValidationReport::skipped("no model available for the validator", None));
    };
    let state = request.state;
    let notes = read_notes(request.paths)?;
    let prompt = prompts.render_validator(&ValidatorPrompt {
        task: &state.task,
        workdir: &state.workdir,
        notes: &notes,
        marker_text: &state.marker_text,
    })?;

    let prompt_bytes = prompt.len();
    let log = AttemptPaths::validator(&request.paths.logs_dir, request.iteration);
    let started_at = Utc::now().to_rfc3339();
    let run = match agent.run(
        &AgentRequest {
            session: state.id.clone(),
            model: model.clone(),
            prompt,
            workdir: PathBuf::from(&state.workdir),
            writable_paths: request.writable_paths.to_vec(),
            sandbox: request.sandbox,
            log_path: log.log_path.clone(),
            watch: request.watch,
        },
        interrupt,
    ) {
        Ok(run) => run,
        Err(err) => {
            warn!(err = %err, "validator could not run");
            return Ok(ValidationReport::skipped(
                format!("validator could not run: {err:#}"),
                Some(model),
            ));
        }
    };

    let transcript = parse_transcript(&run.stdout);
    let class = classify_attempt(
        &AttemptFacts {
            exit_code: run.exit_code,
            stalled: run.stalled,
            interrupted: run.interrupted,
            output_bytes: run.output_bytes,
            duration: run.duration,
            rate_limit_match: detector.detect(&run.output).map(str::to_string),
        },
        crash,
    );
    log.write_meta(&AttemptMeta {
        iteration: request.iteration,
        attempt: 0,
        model: model.clone(),
        sandbox: request.sandbox.to_string(),
        outcome: class_label(&class).to_string(),
        exit_code: run.exit_code,
        output_bytes: run.output_bytes,
        duration_ms: duration_ms(run.duration),
        started_at,
        prompt_bytes,
    })?;

    let text = transcript.joined_text();
    let outcome = match &class {
        AttemptClass::Clean if contains_marker(&text, &state.marker_text) => {
            ValidationOutcome::Confirmed
        }
        AttemptClass::Clean => ValidationOutcome::Rejected {
            feedback: feedback_tail(&text),
        },
        other => ValidationOutcome::Skipped {
            reason: format!("validator run ended {}", class_label(other)),
        },
    };
    info!(model = %model, ?outcome, "validator finished");
    Ok(ValidationReport {
        outcome,
        model: Some(model),
        cost: transcript.cost,
        class: Some(class),
    })
}

/// Short label for logs and attempt metadata.
pub fn class_label(class: &AttemptClass) -> &'static str {
    match class {
        AttemptClass::Interrupted => "interrupted",
        AttemptClass::Stalled => "stalled",
        AttemptClass::RateLimited { .. } => "rate_limited",
        AttemptClass::SuspectedCrash => "suspected_crash",
        AttemptClass::Failed { .. } => "failed",
        AttemptClass::Clean => "clean",
    }
}

pub(crate) fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn feedback_tail(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "The reviewer did not confirm completion and gave no details.".to_string();
    }
    let count = text.chars().count();
    if count <= FEEDBACK_LIMIT_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - FEEDBACK_LIMIT_CHARS).collect()
}
