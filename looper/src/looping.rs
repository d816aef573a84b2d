//! Iteration loop controller for `looper run`.
//!
//! One call to [`LoopController::run`] claims a session, then runs iterations
//! until completion is confirmed, the budget is exhausted, the iteration
//! ceiling is reached, or an interrupt arrives. Fatal errors (no model in any
//! tier, lock timeouts, agent launch failures) are returned as `Err`. Every
//! path, fatal or not, goes through the same terminal cleanup.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::backoff::FailureCounter;
use crate::core::budget::{BudgetStatus, check_budget};
use crate::core::classifier::{AttemptClass, AttemptFacts, classify_attempt};
use crate::core::completion::contains_marker;
use crate::core::events::parse_transcript;
use crate::core::rate_limit::RateLimitDetector;
use crate::core::selector::tier_of;
use crate::core::struggle::{append_record, is_reset_iteration, struggle_hints};
use crate::core::types::{
    ABSOLUTE_MAX_ITERATIONS, CompletionMode, IterationHistory, IterationRecord, LoopStop,
    SessionState,
};
use crate::error::{NoModelsAvailable, NoSlotAvailable};
use crate::io::agent::{Agent, AgentRequest};
use crate::io::config::LooperConfig;
use crate::io::context::{
    discard_one_shot, reset_notes, take_pending_context, take_validator_feedback,
    write_validator_feedback,
};
use crate::io::cost::{CostContext, CostLedger};
use crate::io::interrupt::InterruptFlag;
use crate::io::iteration_log::{AttemptMeta, AttemptPaths};
use crate::io::prompt::{IterationPrompt, PromptEngine};
use crate::io::rate_limits::ModelRegistry;
use crate::io::sandbox::{
    EffectiveSandbox, Probe, SandboxMode, container_label, kill_labeled_containers, resolve,
};
use crate::io::session::{SessionPaths, history_key, state_key};
use crate::io::slots::SlotGuard;
use crate::io::snapshot::Snapshot;
use crate::io::store::{FileStore, Store};
use crate::start::{SessionSettings, claim_session, release_session};
use crate::validate::{
    ValidationOutcome, ValidatorRequest, class_label, duration_ms, run_validator,
};

/// Interrupt checks while sleeping (backoff, slot waits).
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Per-invocation options that are not persisted with the session.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub allow_fallback: bool,
    /// Spend limit in USD for this session.
    pub budget: Option<f64>,
    pub sandbox: SandboxMode,
    /// Extra writable paths besides the working directory.
    pub writable_paths: Vec<PathBuf>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            allow_fallback: true,
            budget: None,
            sandbox: SandboxMode::Auto,
            writable_paths: Vec::new(),
        }
    }
}

/// Progress notifications for the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Started {
        session: String,
        resumed: bool,
        sandbox: EffectiveSandbox,
        warnings: Vec<String>,
    },
    StateReset {
        iteration: u32,
    },
    WaitingForSlot {
        model: String,
    },
    Retrying {
        iteration: u32,
        model: String,
        reason: String,
    },
    IterationFinished {
        iteration: u32,
        model: String,
        outcome: &'static str,
        changed_files: usize,
        cost: Option<f64>,
        completion: bool,
    },
    CompletionBelowFloor {
        iteration: u32,
        min_iterations: u32,
    },
    ValidationRejected {
        iteration: u32,
    },
    ValidationSkipped {
        iteration: u32,
        reason: String,
    },
    BudgetWarning {
        spent: f64,
        limit: f64,
        percent: f64,
    },
    BackingOff {
        delay: Duration,
        failures: u32,
    },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    pub session: String,
    /// Iterations consumed by this invocation.
    pub iterations_run: u32,
    /// Total recorded spend for the session.
    pub spent: f64,
    pub stop: LoopStop,
}

/// Mutable context threaded through one invocation.
struct LoopSession<'o> {
    state: SessionState,
    paths: SessionPaths,
    sandbox: EffectiveSandbox,
    options: &'o LoopOptions,
    iterations_run: u32,
    failures: FailureCounter,
    budget_warned: bool,
}

impl LoopSession<'_> {
    fn workdir(&self) -> PathBuf {
        PathBuf::from(&self.state.workdir)
    }

    /// Caller paths plus the session directory (agent notes live there).
    fn writable_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.options.writable_paths.clone();
        paths.push(self.paths.dir.clone());
        paths
    }

    fn cost_context(&self) -> CostContext<'_> {
        CostContext {
            session: &self.state.id,
            task: &self.state.task,
            workdir: &self.state.workdir,
        }
    }
}

type EventSink<'e> = dyn FnMut(&LoopEvent) + 'e;

pub struct LoopController<'a, A: Agent> {
    store: &'a FileStore,
    config: &'a LooperConfig,
    agent: &'a A,
    probe: &'a dyn Probe,
    interrupt: &'a InterruptFlag,
    prompts: PromptEngine,
    detector: RateLimitDetector,
}

impl<'a, A: Agent> LoopController<'a, A> {
    pub fn new(
        store: &'a FileStore,
        config: &'a LooperConfig,
        agent: &'a A,
        probe: &'a dyn Probe,
        interrupt: &'a InterruptFlag,
    ) -> Result<Self> {
        Ok(Self {
            store,
            config,
            agent,
            probe,
            interrupt,
            prompts: PromptEngine::new(),
            detector: RateLimitDetector::new(&config.rate_limit.patterns)?,
        })
    }

    /// Claim the session and loop until a stop condition.
    #[instrument(skip_all, fields(session = ?session))]
    pub fn run<F: FnMut(&LoopEvent)>(
        &self,
        session: Option<&str>,
        settings: &SessionSettings,
        options: &LoopOptions,
        mut on_event: F,
    ) -> Result<LoopOutcome> {
        let claimed = claim_session(
            self.store,
            session,
            settings,
            self.config.session_stale_after(),
        )?;
        let id = claimed.state.id.clone();
        let resolution = resolve(options.sandbox, self.agent.kind(), self.probe);
        let mut run = LoopSession {
            paths: SessionPaths::new(self.store.root(), &id),
            state: claimed.state,
            sandbox: resolution.mode,
            options,
            iterations_run: 0,
            failures: FailureCounter::default(),
            budget_warned: false,
        };
        on_event(&LoopEvent::Started {
            session: id.clone(),
            resumed: claimed.resumed,
            sandbox: resolution.mode,
            warnings: resolution.warnings,
        });

        let result = self.drive(&mut run, &mut on_event);
        let reason = match &result {
            Ok(stop) => stop.to_string(),
            Err(err) => format!("fatal: {err:#}"),
        };
        let cleanup = self.cleanup(&run, &reason);
        let stop = result?;
        cleanup?;

        let spent = CostLedger::new(self.store).total_for(&id)?;
        info!(session = %id, %reason, iterations = run.iterations_run, spent, "loop stopped");
        Ok(LoopOutcome {
            session: id,
            iterations_run: run.iterations_run,
            spent,
            stop,
        })
    }

    fn drive(&self, run: &mut LoopSession<'_>, on_event: &mut EventSink<'_>) -> Result<LoopStop> {
        loop {
            let next = run.state.iteration + 1;
            if self.interrupt.is_raised() {
                return Ok(LoopStop::Interrupted { iteration: next });
            }
            if let Some(stop) = self.budget_stop(run, on_event)? {
                return Ok(stop);
            }
            let ceiling = run.state.iteration_ceiling();
            if next > ceiling {
                let max = run.state.max_iterations;
                return Ok(LoopStop::MaxIterations {
                    iterations: run.state.iteration,
                    limit: ceiling,
                    absolute: max == 0 || max > ABSOLUTE_MAX_ITERATIONS,
                });
            }
            if let Some(stop) = self.run_iteration(run, next, on_event)? {
                return Ok(stop);
            }
        }
    }

    /// Run iteration `n`, retrying it in place for retry-class attempts.
    /// Returns a stop reason, or `None` to continue with `n + 1`.
    #[instrument(skip_all, fields(iteration = n))]
    fn run_iteration(
        &self,
        run: &mut LoopSession<'_>,
        n: u32,
        on_event: &mut EventSink<'_>,
    ) -> Result<Option<LoopStop>> {
        let lock = self.config.lock_options();
        let fresh_start = is_reset_iteration(n, self.config.looping.state_reset_interval);
        if fresh_start {
            self.reset_scratch(run)?;
            on_event(&LoopEvent::StateReset { iteration: n });
        }
        let history: IterationHistory = self.store.read(&history_key(&run.state.id))?;
        let hints = struggle_hints(&history.struggle);
        let pending = take_pending_context(&run.paths, &lock)?;
        let feedback = take_validator_feedback(&run.paths, &lock)?;

        let registry = ModelRegistry::new(self.store, &self.config.models);
        let ledger = CostLedger::new(self.store);
        let workdir = run.workdir();
        let notes_path = run.paths.notes_path.display().to_string();
        let ceiling = (run.state.max_iterations > 0).then(|| run.state.iteration_ceiling());
        let mut attempt = 0u32;

        loop {
            let model = self.select_model(&run.state, run.options.allow_fallback)?;
            let Some(slot) = self.wait_for_slot(&model, on_event)? else {
                return Ok(Some(LoopStop::Interrupted { iteration: n }));
            };

            let before = Snapshot::capture(&workdir)?;
            let prompt = self.prompts.render_iteration(&IterationPrompt {
                task: &run.state.task,
                workdir: &run.state.workdir,
                iteration: n,
                ceiling,
                notes_path: &notes_path,
                marker_text: &run.state.marker_text,
                fresh_start,
                pending_context: pending.as_deref(),
                validator_feedback: feedback.as_deref(),
                hints: &hints,
            })?;
            let prompt_bytes = prompt.len();
            let log = AttemptPaths::iteration(&run.paths.logs_dir, n, attempt);
            let started_at = Utc::now().to_rfc3339();
            debug!(model = %model, attempt, "starting attempt");

            let result = self.agent.run(
                &AgentRequest {
                    session: run.state.id.clone(),
                    model: model.clone(),
                    prompt,
                    workdir: workdir.clone(),
                    writable_paths: run.writable_paths(),
                    sandbox: run.sandbox,
                    log_path: log.log_path.clone(),
                    watch: self.config.watch_options(),
                },
                self.interrupt,
            );
            slot.release()?;
            let agent_run = result?;

            let changed_files = before.changed_files(&Snapshot::capture(&workdir)?);
            let transcript = parse_transcript(&agent_run.stdout);
            let class = classify_attempt(
                &AttemptFacts {
                    exit_code: agent_run.exit_code,
                    stalled: agent_run.stalled,
                    interrupted: agent_run.interrupted,
                    output_bytes: agent_run.output_bytes,
                    duration: agent_run.duration,
                    rate_limit_match: self.detector.detect(&agent_run.output).map(str::to_string),
                },
                &self.config.crash_thresholds(),
            );
            log.write_meta(&AttemptMeta {
                iteration: n,
                attempt,
                model: model.clone(),
                sandbox: run.sandbox.to_string(),
                outcome: class_label(&class).to_string(),
                exit_code: agent_run.exit_code,
                output_bytes: agent_run.output_bytes,
                duration_ms: duration_ms(agent_run.duration),
                started_at: started_at.clone(),
                prompt_bytes,
            })?;

            if class == AttemptClass::Interrupted {
                return Ok(Some(LoopStop::Interrupted { iteration: n }));
            }
            if let Some(cost) = transcript.cost {
                ledger.record_iteration(&run.cost_context(), &model, n, cost)?;
            }

            if class.is_retry() {
                registry.mark_rate_limited(&model, self.cooldown_for(&class))?;
                if attempt < self.config.looping.max_retries_per_iteration {
                    attempt += 1;
                    run.state = self.store.update(&state_key(&run.state.id), |s: &mut SessionState| {
                        s.retries = attempt;
                        s.updated_at = Some(Utc::now().to_rfc3339());
                        Ok(())
                    })?;
                    let reason = describe_retry(&class, self.config.looping.stall_timeout_secs);
                    warn!(model = %model, attempt, %reason, "retrying iteration");
                    on_event(&LoopEvent::Retrying {
                        iteration: n,
                        model,
                        reason,
                    });
                    if let Some(stop) = self.budget_stop(run, on_event)? {
                        return Ok(Some(stop));
                    }
                    continue;
                }
                warn!(model = %model, attempt, "retry cap reached, consuming iteration");
            }

            let completion = class == AttemptClass::Clean
                && contains_marker(&transcript.joined_text(), &run.state.marker_text);
            let record = IterationRecord {
                iteration: n,
                model: model.clone(),
                duration_ms: duration_ms(agent_run.duration),
                exit_code: agent_run.exit_code,
                completion_detected: completion,
                changed_files,
                cost: transcript.cost,
                started_at: Some(started_at),
            };
            self.consume(run, record.clone())?;
            on_event(&LoopEvent::IterationFinished {
                iteration: n,
                model,
                outcome: class_label(&class),
                changed_files: record.changed_files.len(),
                cost: record.cost,
                completion,
            });

            let failed = class != AttemptClass::Clean;
            let failures = run.failures.observe(
                failed,
                agent_run.duration,
                self.config.short_iteration(),
            );

            if completion && let Some(stop) = self.on_completion(run, n, on_event)? {
                return Ok(Some(stop));
            }
            if let Some(stop) = self.budget_stop(run, on_event)? {
                return Ok(Some(stop));
            }
            if failed {
                let delay = self.config.backoff().delay(failures);
                if !delay.is_zero() {
                    on_event(&LoopEvent::BackingOff { delay, failures });
                    self.interrupt.sleep(delay, SLEEP_STEP);
                }
            }
            return Ok(None);
        }
    }

    /// Append the record (and its struggle counters) and advance the
    /// session's iteration counter.
    fn consume(&self, run: &mut LoopSession<'_>, record: IterationRecord) -> Result<()> {
        let short = self.config.short_iteration();
        let n = record.iteration;
        self.store
            .update(&history_key(&run.state.id), |h: &mut IterationHistory| {
                append_record(h, record, short);
                Ok(())
            })?;
        run.state = self
            .store
            .update(&state_key(&run.state.id), |s: &mut SessionState| {
                s.iteration = n;
                s.retries = 0;
                s.updated_at = Some(Utc::now().to_rfc3339());
                Ok(())
            })?;
        run.iterations_run += 1;
        Ok(())
    }

    /// Marker seen on iteration `n`: apply the minimum floor and, in
    /// validate mode, the validator pass.
    fn on_completion(
        &self,
        run: &mut LoopSession<'_>,
        n: u32,
        on_event: &mut EventSink<'_>,
    ) -> Result<Option<LoopStop>> {
        if n < run.state.min_iterations {
            info!(iteration = n, min = run.state.min_iterations, "completion below minimum iterations");
            on_event(&LoopEvent::CompletionBelowFloor {
                iteration: n,
                min_iterations: run.state.min_iterations,
            });
            return Ok(None);
        }
        if run.state.completion_mode == CompletionMode::Marker {
            return Ok(Some(LoopStop::Completed { iteration: n }));
        }
        if let Some(stop) = self.budget_stop(run, on_event)? {
            return Ok(Some(stop));
        }

        let registry = ModelRegistry::new(self.store, &self.config.models);
        let model = match registry.next_available_model(run.state.tier, run.options.allow_fallback) {
            Ok(model) => Some(model),
            Err(err) if err.downcast_ref::<NoModelsAvailable>().is_some() => None,
            Err(err) => return Err(err),
        };
        let slot = match &model {
            Some(model) => match self.wait_for_slot(model, on_event)? {
                Some(slot) => Some(slot),
                None => return Ok(Some(LoopStop::Interrupted { iteration: n })),
            },
            None => None,
        };
        let writable = run.writable_paths();
        let report = run_validator(
            self.agent,
            &self.prompts,
            &self.detector,
            &self.config.crash_thresholds(),
            &ValidatorRequest {
                state: &run.state,
                paths: &run.paths,
                iteration: n,
                model,
                sandbox: run.sandbox,
                writable_paths: &writable,
                watch: self.config.watch_options(),
            },
            self.interrupt,
        )?;
        if let Some(slot) = slot {
            slot.release()?;
        }

        if let (Some(cost), Some(model)) = (report.cost, report.model.as_deref()) {
            CostLedger::new(self.store).record_iteration(&run.cost_context(), model, n, cost)?;
        }
        if let (Some(class), Some(model)) = (&report.class, report.model.as_deref())
            && class.is_retry()
        {
            registry.mark_rate_limited(model, self.cooldown_for(class))?;
        }
        if report.class == Some(AttemptClass::Interrupted) {
            return Ok(Some(LoopStop::Interrupted { iteration: n }));
        }

        match report.outcome {
            ValidationOutcome::Confirmed => Ok(Some(LoopStop::Completed { iteration: n })),
            ValidationOutcome::Rejected { feedback } => {
                write_validator_feedback(&run.paths, &feedback)?;
                on_event(&LoopEvent::ValidationRejected { iteration: n });
                Ok(None)
            }
            ValidationOutcome::Skipped { reason } => {
                warn!(iteration = n, %reason, "validation skipped, completion not accepted");
                on_event(&LoopEvent::ValidationSkipped {
                    iteration: n,
                    reason,
                });
                Ok(None)
            }
        }
    }

    /// `BudgetExceeded` once recorded spend reaches the limit. Emits a single
    /// warning per invocation when the warn threshold is crossed.
    fn budget_stop(
        &self,
        run: &mut LoopSession<'_>,
        on_event: &mut EventSink<'_>,
    ) -> Result<Option<LoopStop>> {
        let Some(limit) = run.options.budget else {
            return Ok(None);
        };
        let spent = CostLedger::new(self.store).total_for(&run.state.id)?;
        match check_budget(spent, limit, self.config.looping.budget_warn_fraction) {
            BudgetStatus::Ok => Ok(None),
            BudgetStatus::Warning { percent } => {
                if !run.budget_warned {
                    run.budget_warned = true;
                    warn!(spent, limit, percent, "budget warning");
                    on_event(&LoopEvent::BudgetWarning {
                        spent,
                        limit,
                        percent,
                    });
                }
                Ok(None)
            }
            BudgetStatus::Exceeded => Ok(Some(LoopStop::BudgetExceeded { spent, limit })),
        }
    }

    /// Pinned model while it is not cooling down, else the registry's pick
    /// starting at the pinned model's tier (or the session tier).
    fn select_model(&self, state: &SessionState, allow_fallback: bool) -> Result<String> {
        let registry = ModelRegistry::new(self.store, &self.config.models);
        let tier = match state.model.as_deref() {
            Some(pinned) => {
                if !registry.is_cooling_down(pinned)? {
                    return Ok(pinned.to_string());
                }
                tier_of(&self.config.models, pinned).unwrap_or(state.tier)
            }
            None => state.tier,
        };
        registry.next_available_model(tier, allow_fallback)
    }

    /// Block until a slot for `model` is free. `None` if interrupted first.
    fn wait_for_slot(&self, model: &str, on_event: &mut EventSink<'_>) -> Result<Option<SlotGuard>> {
        let poll = Duration::from_millis(self.config.looping.poll_interval_ms);
        let mut announced = false;
        loop {
            match SlotGuard::acquire(self.store, &self.config.concurrency, model) {
                Ok(guard) => return Ok(Some(guard)),
                Err(err) if err.downcast_ref::<NoSlotAvailable>().is_some() => {
                    if !announced {
                        announced = true;
                        info!(model, "waiting for a concurrency slot");
                        on_event(&LoopEvent::WaitingForSlot {
                            model: model.to_string(),
                        });
                    }
                    if self.interrupt.sleep(poll, SLEEP_STEP) {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn reset_scratch(&self, run: &LoopSession<'_>) -> Result<()> {
        reset_notes(&run.paths)?;
        self.store
            .update(&history_key(&run.state.id), |h: &mut IterationHistory| {
                h.struggle = Default::default();
                Ok(())
            })?;
        info!(session = %run.state.id, "scratch notes and struggle counters reset");
        Ok(())
    }

    fn cooldown_for(&self, class: &AttemptClass) -> Duration {
        let secs = match class {
            AttemptClass::Stalled => self.config.cooldowns.stall_secs,
            AttemptClass::SuspectedCrash => self.config.cooldowns.crash_secs,
            _ => self.config.cooldowns.default_secs,
        };
        Duration::from_secs(secs)
    }

    /// Terminal cleanup. Every step runs; the first failure is returned.
    fn cleanup(&self, run: &LoopSession<'_>, reason: &str) -> Result<()> {
        let mut first_err: Option<anyhow::Error> = None;
        let id = &run.state.id;

        if let Err(err) = discard_one_shot(&run.paths, &self.config.lock_options()) {
            error!(session = %id, err = %err, "failed to discard one-shot notes");
            first_err.get_or_insert(err);
        }
        if run.sandbox == EffectiveSandbox::Container {
            let timeout = Duration::from_secs(self.config.sandbox.probe_timeout_secs.max(1) * 2);
            if let Err(err) = kill_labeled_containers(
                &self.config.sandbox.container_runtime,
                &container_label(id),
                timeout,
            ) {
                error!(session = %id, err = %err, "failed to kill session containers");
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = release_session(self.store, id, reason) {
            error!(session = %id, err = %err, "failed to release session");
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(anyhow!("cleanup for session '{id}' incomplete: {err:#}")),
            None => Ok(()),
        }
    }
}

fn describe_retry(class: &AttemptClass, stall_secs: u64) -> String {
    match class {
        AttemptClass::Stalled => format!("no output growth for {stall_secs}s"),
        AttemptClass::RateLimited { pattern } => format!("rate limit pattern '{pattern}' matched"),
        AttemptClass::SuspectedCrash => "negligible output in a very short run".to_string(),
        other => class_label(other).to_string(),
    }
}
