//! `looper`: run an AI agent on one task until it genuinely finishes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use looper::core::types::{CompletionMode, Tier};
use looper::exit_codes;
use looper::io::agent::ProcessAgent;
use looper::io::config::{
    LooperConfig, config_path, default_state_root, load_config, write_config,
};
use looper::io::interrupt::{self, InterruptFlag};
use looper::io::mcp::McpConfig;
use looper::io::sandbox::{AgentKind, SandboxMode, SystemProbe};
use looper::io::session::load_session;
use looper::io::store::FileStore;
use looper::logging;
use looper::looping::{LoopController, LoopEvent, LoopOptions};
use looper::start::SessionSettings;
use looper::status;

#[derive(Parser)]
#[command(
    name = "looper",
    version,
    about = "Run an AI agent on one task, iteration after iteration, until it is done"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session or resume an existing one.
    Run(RunArgs),
    /// List sessions.
    List,
    /// Show one session's state, spend, and recent iterations.
    Status { session: String },
    /// Queue a note for the session's next iteration.
    Inject {
        session: String,
        /// Note text (words are joined with spaces).
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Write the default looper.toml into the state root.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Session id to resume or create (generated when omitted).
    #[arg(long)]
    session: Option<String>,
    /// Task description (required for a new session).
    #[arg(long, conflicts_with = "task_file")]
    task: Option<String>,
    /// Read the task description from a file.
    #[arg(long)]
    task_file: Option<PathBuf>,
    /// Working directory for the agent (defaults to the current directory).
    #[arg(long)]
    workdir: Option<PathBuf>,
    /// Agent CLI to drive.
    #[arg(long, default_value = "claude")]
    agent: AgentKind,
    /// Model tier to start from.
    #[arg(long)]
    tier: Option<Tier>,
    /// Pin a model; the tier registry takes over while it cools down.
    #[arg(long)]
    model: Option<String>,
    /// Do not descend to lower tiers when a tier is exhausted.
    #[arg(long)]
    no_fallback: bool,
    /// Keep iterating until at least this many iterations ran.
    #[arg(long)]
    min_iterations: Option<u32>,
    /// Stop after this many iterations (0 = unlimited, still capped).
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Kill an iteration whose output stops growing for this many seconds.
    #[arg(long)]
    stall_timeout: Option<u64>,
    /// Wipe notes and struggle counters every K iterations (0 disables).
    #[arg(long)]
    reset_interval: Option<u32>,
    /// Sandbox mode (defaults to the config file's mode).
    #[arg(long)]
    sandbox: Option<SandboxMode>,
    /// Extra writable path for the agent (repeatable).
    #[arg(long = "allow-write")]
    allow_write: Vec<PathBuf>,
    /// MCP server config (`{"mcpServers": {...}}`).
    #[arg(long)]
    mcp_config: Option<PathBuf>,
    /// Spend limit in USD.
    #[arg(long)]
    budget: Option<f64>,
    /// How a completion claim is confirmed.
    #[arg(long)]
    completion: Option<CompletionMode>,
    /// Completion marker text (the agent prints `<promise>TEXT</promise>`).
    #[arg(long)]
    marker: Option<String>,
}

fn main() {
    if let Err(err) = logging::init() {
        eprintln!("{err:#}");
    }
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FATAL
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    // clap's own usage-error code would collide with BUDGET_EXCEEDED.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return Ok(if err.use_stderr() {
                exit_codes::FATAL
            } else {
                exit_codes::OK
            });
        }
    };
    let root = default_state_root()?;
    fs::create_dir_all(&root).with_context(|| format!("create state root {}", root.display()))?;

    match cli.command {
        Command::Run(args) => cmd_run(&root, args),
        Command::List => cmd_list(&root),
        Command::Status { session } => cmd_status(&root, &session),
        Command::Inject { session, text } => cmd_inject(&root, &session, &text.join(" ")),
        Command::InitConfig { force } => cmd_init_config(&root, force),
    }
}

fn cmd_run(root: &Path, args: RunArgs) -> Result<i32> {
    let mut cfg = load_config(&config_path(root))?;
    if let Some(secs) = args.stall_timeout {
        cfg.looping.stall_timeout_secs = secs;
    }
    if let Some(k) = args.reset_interval {
        cfg.looping.state_reset_interval = k;
    }
    cfg.validate().context("invalid run options")?;
    if let Some(budget) = args.budget
        && !(budget.is_finite() && budget > 0.0)
    {
        bail!("--budget must be a positive amount, got {budget}");
    }

    let store = FileStore::new(root, cfg.lock_options());
    let cwd = env::current_dir().context("read current directory")?;
    let task = match (&args.task, &args.task_file) {
        (Some(task), _) => Some(task.clone()),
        (None, Some(path)) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("read task file {}", path.display()))?,
        ),
        (None, None) => None,
    };
    let existing = match args.session.as_deref() {
        Some(id) => load_session(&store, id)?,
        None => None,
    };
    let workdir = match &args.workdir {
        Some(dir) => Some(canonical_dir(dir)?),
        None if existing.is_some() => None,
        None => Some(canonical_dir(&cwd)?),
    };
    let settings = SessionSettings {
        task,
        workdir,
        tier: args.tier,
        model: args.model.clone(),
        min_iterations: args.min_iterations,
        max_iterations: args.max_iterations,
        marker_text: args.marker.clone(),
        completion_mode: args.completion,
    };
    let options = LoopOptions {
        allow_fallback: !args.no_fallback,
        budget: args.budget,
        sandbox: args.sandbox.unwrap_or(cfg.sandbox.mode),
        writable_paths: args
            .allow_write
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { cwd.join(p) })
            .collect(),
    };
    let mcp = args
        .mcp_config
        .as_deref()
        .map(McpConfig::load)
        .transpose()?;
    let program = match args.agent {
        AgentKind::Claude => cfg.agents.claude.clone(),
        AgentKind::Codex => cfg.agents.codex.clone(),
    };

    let interrupt = InterruptFlag::new();
    interrupt::install(&interrupt)?;
    let agent = ProcessAgent::new(args.agent, program, mcp, cfg.sandbox.clone());
    let probe = SystemProbe::new(&cfg.sandbox);
    let controller = LoopController::new(&store, &cfg, &agent, &probe, &interrupt)?;

    let outcome = controller.run(args.session.as_deref(), &settings, &options, print_event)?;
    println!(
        "session {}: {} ({} iteration(s) this run, ${:.2} spent)",
        outcome.session, outcome.stop, outcome.iterations_run, outcome.spent
    );
    Ok(exit_codes::for_stop(&outcome.stop))
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::Started {
            session,
            resumed,
            sandbox,
            warnings,
        } => {
            for warning in warnings {
                eprintln!("warning: {warning}");
            }
            let verb = if *resumed { "resuming" } else { "starting" };
            eprintln!("{verb} session {session} (sandbox: {sandbox})");
        }
        LoopEvent::StateReset { iteration } => {
            eprintln!("iteration {iteration}: notes and struggle counters reset");
        }
        LoopEvent::WaitingForSlot { model } => {
            eprintln!("waiting for a free {model} slot");
        }
        LoopEvent::Retrying {
            iteration,
            model,
            reason,
        } => eprintln!("iteration {iteration}: {model} {reason}; retrying on another model"),
        LoopEvent::IterationFinished {
            iteration,
            model,
            outcome,
            changed_files,
            cost,
            completion,
        } => {
            let cost = cost.map_or_else(String::new, |c| format!(", ${c:.2}"));
            let marker = if *completion { ", completion claimed" } else { "" };
            eprintln!(
                "iteration {iteration}: {model} {outcome}, {changed_files} file(s) changed{cost}{marker}"
            );
        }
        LoopEvent::CompletionBelowFloor {
            iteration,
            min_iterations,
        } => eprintln!(
            "iteration {iteration}: completion claimed before the minimum of {min_iterations} iterations; continuing"
        ),
        LoopEvent::ValidationRejected { iteration } => {
            eprintln!("iteration {iteration}: validator rejected the completion claim");
        }
        LoopEvent::ValidationSkipped { iteration, reason } => {
            eprintln!("iteration {iteration}: validation skipped ({reason}); not treated as complete");
        }
        LoopEvent::BudgetWarning {
            spent,
            limit,
            percent,
        } => eprintln!("warning: spent ${spent:.2} of ${limit:.2} budget ({percent:.0}%)"),
        LoopEvent::BackingOff { delay, failures } => eprintln!(
            "backing off {}s after {failures} consecutive failure(s)",
            delay.as_secs()
        ),
    }
}

fn cmd_list(root: &Path) -> Result<i32> {
    let cfg = load_config(&config_path(root))?;
    let store = FileStore::new(root, cfg.lock_options());
    print!("{}", status::render_list(&status::list(&store)?));
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path, session: &str) -> Result<i32> {
    let cfg = load_config(&config_path(root))?;
    let store = FileStore::new(root, cfg.lock_options());
    print!("{}", status::render_status(&status::status(&store, &cfg, session)?));
    Ok(exit_codes::OK)
}

fn cmd_inject(root: &Path, session: &str, text: &str) -> Result<i32> {
    let cfg = load_config(&config_path(root))?;
    let store = FileStore::new(root, cfg.lock_options());
    status::inject(&store, &cfg, session, text)?;
    println!("queued context for session {session}");
    Ok(exit_codes::OK)
}

fn cmd_init_config(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &LooperConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn canonical_dir(dir: &Path) -> Result<PathBuf> {
    let canonical =
        fs::canonicalize(dir).with_context(|| format!("resolve directory {}", dir.display()))?;
    if !canonical.is_dir() {
        return Err(anyhow!("{} is not a directory", canonical.display()));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "looper",
            "run",
            "--task",
            "fix it",
            "--tier",
            "medium",
            "--sandbox",
            "none",
            "--completion",
            "validate",
            "--allow-write",
            "/tmp/a",
            "--allow-write",
            "/tmp/b",
            "--budget",
            "5",
            "--no-fallback",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.tier, Some(Tier::Medium));
        assert_eq!(args.sandbox, Some(SandboxMode::None));
        assert_eq!(args.completion, Some(CompletionMode::Validate));
        assert_eq!(args.allow_write.len(), 2);
        assert_eq!(args.budget, Some(5.0));
        assert!(args.no_fallback);
        assert_eq!(args.agent, AgentKind::Claude);
    }

    #[test]
    fn task_and_task_file_conflict() {
        let parsed = Cli::try_parse_from([
            "looper",
            "run",
            "--task",
            "a",
            "--task-file",
            "b.md",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn inject_joins_words() {
        let cli = Cli::parse_from(["looper", "inject", "s1", "use", "the", "cache"]);
        let Command::Inject { session, text } = cli.command else {
            panic!("expected inject");
        };
        assert_eq!(session, "s1");
        assert_eq!(text.join(" "), "use the cache");
    }

    #[test]
    fn unknown_tier_is_rejected() {
        assert!(Cli::try_parse_from(["looper", "run", "--tier", "ultra"]).is_err());
    }
}
