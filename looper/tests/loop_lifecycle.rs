//! Loop-level tests for full session lifecycles.
//!
//! These drive `LoopController::run` with a scripted agent to cover the stop
//! conditions, same-iteration retries, tier fallback, scheduled resets,
//! validator verdicts, and one-shot operator context.

use looper::core::types::{CompletionMode, IterationHistory, LoopStop};
use looper::exit_codes;
use looper::io::config::LooperConfig;
use looper::io::interrupt::InterruptFlag;
use looper::io::rate_limits::ModelRegistry;
use looper::io::sandbox::SandboxMode;
use looper::io::session::{history_key, load_session};
use looper::io::store::{FileStore, Store};
use looper::looping::{LoopController, LoopEvent, LoopOptions, LoopOutcome};
use looper::start::{SessionSettings, claim_session, release_session};
use looper::status;
use looper::test_support::{
    FixedProbe, ScriptedAgent, ScriptedStep, TestEnv, claude_output, test_config,
};

fn settings(env: &TestEnv) -> SessionSettings {
    SessionSettings {
        task: Some("implement the parser".to_string()),
        workdir: Some(env.workdir()),
        ..SessionSettings::default()
    }
}

fn options() -> LoopOptions {
    LoopOptions {
        sandbox: SandboxMode::None,
        ..LoopOptions::default()
    }
}

fn working(cost: f64) -> ScriptedStep {
    ScriptedStep::output(claude_output("made progress, more to do", cost))
}

fn finished(cost: f64) -> ScriptedStep {
    ScriptedStep::output(claude_output("all done <promise>COMPLETE</promise>", cost))
}

struct Run {
    outcome: LoopOutcome,
    events: Vec<LoopEvent>,
}

fn run_loop(
    store: &FileStore,
    cfg: &LooperConfig,
    agent: &ScriptedAgent,
    settings: &SessionSettings,
    options: &LoopOptions,
) -> Run {
    let interrupt = InterruptFlag::new();
    let probe = FixedProbe::default();
    let controller =
        LoopController::new(store, cfg, agent, &probe, &interrupt).expect("controller");
    let mut events = Vec::new();
    let outcome = controller
        .run(Some("job"), settings, options, |e| events.push(e.clone()))
        .expect("loop");
    Run { outcome, events }
}

/// "This is iteration N" from a rendered prompt.
fn iteration_line(prompt: &str) -> &str {
    let line = prompt
        .lines()
        .find(|line| line.starts_with("This is iteration"))
        .expect("iteration line");
    line.split('.').next().unwrap_or(line)
}

#[test]
fn completion_before_minimum_is_ignored_until_the_floor() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![finished(0.1), working(0.1), finished(0.1)]);

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            min_iterations: Some(3),
            ..settings(&env)
        },
        &options(),
    );

    assert_eq!(run.outcome.stop, LoopStop::Completed { iteration: 3 });
    assert_eq!(exit_codes::for_stop(&run.outcome.stop), exit_codes::OK);
    assert!(run.events.contains(&LoopEvent::CompletionBelowFloor {
        iteration: 1,
        min_iterations: 3
    }));
    assert_eq!(agent.remaining(), 0);
}

#[test]
fn marker_echoed_on_stderr_is_not_completion() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![
        working(0.1).stderr("prompt: finish with <promise>COMPLETE</promise>\n"),
    ]);

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            max_iterations: Some(1),
            ..settings(&env)
        },
        &options(),
    );

    assert_eq!(
        run.outcome.stop,
        LoopStop::MaxIterations {
            iterations: 1,
            limit: 1,
            absolute: false
        }
    );
}

#[test]
fn budget_stops_the_loop_after_the_billed_iteration() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![working(2.75), working(2.75), working(2.75)]);

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &settings(&env),
        &LoopOptions {
            budget: Some(5.0),
            ..options()
        },
    );

    assert_eq!(run.outcome.iterations_run, 2);
    assert_eq!(
        run.outcome.stop.to_string(),
        "budget exceeded: spent $5.50 of $5.00 limit"
    );
    assert_eq!(
        exit_codes::for_stop(&run.outcome.stop),
        exit_codes::BUDGET_EXCEEDED
    );
    assert_eq!(agent.remaining(), 1);

    let state = load_session(&store, "job").expect("load").expect("exists");
    assert!(!state.active);
    assert_eq!(
        state.last_stop.as_deref(),
        Some("budget exceeded: spent $5.50 of $5.00 limit")
    );
}

#[test]
fn rate_limits_retry_the_same_iteration_and_fall_back_a_tier() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![
        ScriptedStep::output("error: 429 Too Many Requests").exit(1),
        ScriptedStep::output("API rate limit reached").exit(1),
        finished(0.4),
    ]);

    let run = run_loop(&store, &cfg, &agent, &settings(&env), &options());

    assert_eq!(run.outcome.stop, LoopStop::Completed { iteration: 1 });
    assert_eq!(run.outcome.iterations_run, 1);
    assert_eq!(agent.models(), vec!["A", "B", "C"]);
    for request in agent.requests() {
        assert_eq!(iteration_line(&request.prompt), "This is iteration 1");
    }
    let retries = run
        .events
        .iter()
        .filter(|e| matches!(e, LoopEvent::Retrying { iteration: 1, .. }))
        .count();
    assert_eq!(retries, 2);

    let registry = ModelRegistry::new(&store, &cfg.models);
    assert!(registry.is_cooling_down("A").expect("cooldown"));
    assert!(registry.is_cooling_down("B").expect("cooldown"));
    assert!(!registry.is_cooling_down("C").expect("cooldown"));

    let history: IterationHistory = store.read(&history_key("job")).expect("history");
    assert_eq!(history.records.len(), 1);
    assert_eq!(history.records[0].model, "C");
}

#[test]
fn stalled_attempt_is_retried_without_consuming_the_iteration() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![
        ScriptedStep::output("thinking...").stalled(),
        working(0.1),
        finished(0.1),
    ]);

    let run = run_loop(&store, &cfg, &agent, &settings(&env), &options());

    assert_eq!(run.outcome.stop, LoopStop::Completed { iteration: 2 });
    assert_eq!(run.outcome.iterations_run, 2);
    let lines: Vec<String> = agent
        .requests()
        .iter()
        .map(|r| iteration_line(&r.prompt).to_string())
        .collect();
    assert_eq!(
        lines,
        vec!["This is iteration 1", "This is iteration 1", "This is iteration 2"]
    );
    assert_eq!(agent.models(), vec!["A", "B", "B"]);
    assert!(run.events.iter().any(|e| matches!(
        e,
        LoopEvent::Retrying { iteration: 1, model, reason }
            if model == "A" && reason.starts_with("no output growth")
    )));
}

#[test]
fn scheduled_resets_clear_notes_on_the_interval() {
    let env = TestEnv::new().expect("env");
    let mut cfg = test_config();
    cfg.looping.state_reset_interval = 5;
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new((0..11).map(|_| working(0.0)).collect());

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            max_iterations: Some(11),
            ..settings(&env)
        },
        &options(),
    );

    assert_eq!(
        run.outcome.stop,
        LoopStop::MaxIterations {
            iterations: 11,
            limit: 11,
            absolute: false
        }
    );
    let fresh: Vec<usize> = agent
        .requests()
        .iter()
        .enumerate()
        .filter(|(_, r)| r.prompt.contains("cleared"))
        .map(|(i, _)| i + 1)
        .collect();
    assert_eq!(fresh, vec![6, 11]);
    let resets: Vec<u32> = run
        .events
        .iter()
        .filter_map(|e| match e {
            LoopEvent::StateReset { iteration } => Some(*iteration),
            _ => None,
        })
        .collect();
    assert_eq!(resets, vec![6, 11]);
}

#[test]
fn max_iterations_stop_and_resume_continues_numbering() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![working(0.1), working(0.1)]);

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            max_iterations: Some(2),
            ..settings(&env)
        },
        &options(),
    );
    assert_eq!(
        run.outcome.stop,
        LoopStop::MaxIterations {
            iterations: 2,
            limit: 2,
            absolute: false
        }
    );
    assert_eq!(
        exit_codes::for_stop(&run.outcome.stop),
        exit_codes::MAX_ITERATIONS
    );

    let agent = ScriptedAgent::new(vec![finished(0.1)]);
    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            max_iterations: Some(5),
            ..SessionSettings::default()
        },
        &options(),
    );
    assert!(matches!(run.events[0], LoopEvent::Started { resumed: true, .. }));
    assert_eq!(run.outcome.stop, LoopStop::Completed { iteration: 3 });
    assert_eq!(run.outcome.iterations_run, 1);
    assert!((run.outcome.spent - 0.3).abs() < 1e-9);
    assert!(agent.requests()[0].prompt.contains("implement the parser"));
}

#[test]
fn validator_rejection_feeds_back_into_the_next_iteration() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![
        finished(0.1),
        ScriptedStep::output(claude_output("the error path has no tests", 0.05)),
        finished(0.1),
        ScriptedStep::output(claude_output("verified <promise>COMPLETE</promise>", 0.05)),
    ]);

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            completion_mode: Some(CompletionMode::Validate),
            ..settings(&env)
        },
        &options(),
    );

    assert_eq!(run.outcome.stop, LoopStop::Completed { iteration: 2 });
    assert!(run.events.contains(&LoopEvent::ValidationRejected { iteration: 1 }));
    assert!((run.outcome.spent - 0.3).abs() < 1e-9);

    let requests = agent.requests();
    assert_eq!(requests.len(), 4);
    assert!(!requests[0].prompt.contains("Reviewer feedback"));
    assert!(requests[2].prompt.contains("Reviewer feedback"));
    assert!(requests[2].prompt.contains("the error path has no tests"));
}

#[test]
fn skipped_validation_never_counts_as_completion() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![
        finished(0.1),
        ScriptedStep::output("validator crashed").exit(2),
        working(0.1),
    ]);

    let run = run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            completion_mode: Some(CompletionMode::Validate),
            max_iterations: Some(2),
            ..settings(&env)
        },
        &options(),
    );

    assert!(matches!(run.outcome.stop, LoopStop::MaxIterations { .. }));
    assert!(
        run.events
            .iter()
            .any(|e| matches!(e, LoopEvent::ValidationSkipped { iteration: 1, .. }))
    );
    assert!(!agent.requests()[2].prompt.contains("Reviewer feedback"));
}

#[test]
fn injected_context_reaches_one_iteration_only() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    claim_session(&store, Some("job"), &settings(&env), cfg.session_stale_after())
        .expect("claim");
    release_session(&store, "job", "created").expect("release");
    status::inject(&store, &cfg, "job", "use the existing tokenizer").expect("inject");

    let agent = ScriptedAgent::new(vec![
        ScriptedStep::output("HTTP 429").exit(1),
        working(0.1),
        working(0.1),
    ]);
    run_loop(
        &store,
        &cfg,
        &agent,
        &SessionSettings {
            max_iterations: Some(2),
            ..SessionSettings::default()
        },
        &options(),
    );

    let requests = agent.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].prompt.contains("use the existing tokenizer"));
    assert!(requests[1].prompt.contains("use the existing tokenizer"));
    assert!(!requests[2].prompt.contains("Operator note"));
}

#[test]
fn interrupt_stops_and_releases_the_session() {
    let env = TestEnv::new().expect("env");
    let cfg = test_config();
    let store = env.store(&cfg);
    let agent = ScriptedAgent::new(vec![working(0.1), ScriptedStep::output("").interrupted()]);

    let run = run_loop(&store, &cfg, &agent, &settings(&env), &options());

    assert_eq!(run.outcome.stop, LoopStop::Interrupted { iteration: 2 });
    assert_eq!(
        exit_codes::for_stop(&run.outcome.stop),
        exit_codes::INTERRUPTED
    );
    let state = load_session(&store, "job").expect("load").expect("exists");
    assert!(!state.active);
    assert_eq!(state.iteration, 1);
    assert_eq!(
        state.last_stop.as_deref(),
        Some("interrupted during iteration 2")
    );
}
