mod cli;
mod ui;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baton::agent::{AgentRunner, StreamEvent};
use baton::config::BatonConfig;
use baton::steps::{build_steps, StepEnv};
use baton::workflow::{Engine, Outcome, Steps};
use cli::{Cli, Command};
use ui::RunProgress;

/// Initialize tracing based on verbosity level.
///
/// - 0: warn
/// - 1: info (-v)
/// - 2: debug (-vv), includes every line agents print
/// - 3+: trace (-vvv)
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // RUST_LOG wins when set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// `run-20260116-142501-3f9a1c2b`: sortable by start time, unique enough for
/// one machine.
fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "run-{}-{}",
        chrono::Utc::now().format("%Y%m%d-%H%M%S"),
        &suffix[..8]
    )
}

/// Registry, coordinator and step handlers for one process.
fn build(config: &BatonConfig) -> Result<Steps> {
    let registry = config.registry()?;
    let runner = AgentRunner::new(Arc::new(config.coordinator()));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<StreamEvent>();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            debug!(agent = %event.agent, stream = ?event.kind, "{}", event.line);
        }
    });

    let mut env = StepEnv::new(registry, runner);
    env.timeouts = config.timeouts();
    env.concurrency = config.concurrency;
    env.events = Some(events_tx);
    env.workdir = std::env::current_dir().ok();

    build_steps(Arc::new(env), &config.roles()).context("building workflow steps")
}

fn initial_data(task: String, branch: Option<String>) -> BTreeMap<String, Value> {
    let mut data = BTreeMap::from([("task".to_string(), json!(task))]);
    if let Some(branch) = branch {
        data.insert("branch".to_string(), json!(branch));
    }
    data
}

/// Run the engine to completion while rendering its updates.
async fn drive(engine: Engine, config: &BatonConfig, cancel: &CancellationToken) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut engine = engine
        .with_updates(tx)
        .with_max_transitions(config.max_transitions);
    let run_id = engine.run_id().to_string();
    let progress = RunProgress::start(&run_id);

    let result = {
        let run = engine.run(cancel);
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => break result,
                Some(update) = rx.recv() => progress.update(&update),
            }
        }
    };
    while let Ok(update) = rx.try_recv() {
        progress.update(&update);
    }

    match result {
        Ok(outcome) => {
            progress.complete(outcome, engine.state());
            if outcome == Outcome::Failed {
                bail!("run {run_id} failed");
            }
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            progress.abandon(&format!(
                "interrupted at step '{}'; continue with `baton resume {run_id}`",
                engine.state().current_step
            ));
            Err(e.into())
        }
        Err(e) => {
            progress.abandon(&e.to_string());
            Err(e).with_context(|| format!("run {run_id}"))
        }
    }
}

fn status(config: &BatonConfig) -> Result<()> {
    let store = config.checkpoint_store();
    let ids = store.list()?;
    if ids.is_empty() {
        println!("No runs in {}", store.dir().display());
        return Ok(());
    }
    for id in ids {
        match store.load(&id) {
            Ok(checkpoint) => {
                let last = checkpoint
                    .history
                    .last()
                    .map(|h| format!("{} → {}", h.step, h.event))
                    .unwrap_or_else(|| "not started".to_string());
                println!(
                    "{id}  step={}  last={last}  saved={}",
                    checkpoint.current_step,
                    checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Err(e) => warn!(run_id = %id, error = %e, "unreadable checkpoint"),
        }
    }
    Ok(())
}

fn check(config: &BatonConfig) -> Result<()> {
    let registry = config.registry()?;
    let mut missing = 0;
    for name in config.workflow_agents() {
        match registry.check_prerequisites(std::slice::from_ref(&name)) {
            Ok(()) => println!("  ✓ {name}"),
            Err(e) => {
                missing += 1;
                println!("  ✗ {e}");
            }
        }
    }
    if missing > 0 {
        bail!("{missing} agent(s) unavailable");
    }
    println!("Configuration OK");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = BatonConfig::load(cli.config.as_deref()).context("loading configuration")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Run {
            task,
            run_id,
            branch,
        } => {
            let steps = build(&config)?;
            let run_id = run_id.unwrap_or_else(new_run_id);
            let engine = Engine::new(
                config.workflow(),
                steps,
                config.checkpoint_store(),
                run_id,
                initial_data(task, branch),
            )?;
            drive(engine, &config, &cancel).await
        }
        Command::Resume { run_id, checkpoint } => {
            let steps = build(&config)?;
            let engine = match (run_id, checkpoint) {
                (_, Some(path)) => Engine::resume_from_path(config.workflow(), steps, &path)?,
                (Some(id), None) => {
                    Engine::resume(config.workflow(), steps, config.checkpoint_store(), &id)?
                }
                (None, None) => bail!("either a run id or --checkpoint is required"),
            };
            drive(engine, &config, &cancel).await
        }
        Command::DryRun { task, branch } => {
            let steps = build(&config)?;
            let plan = Engine::preview(&config.workflow(), &steps, initial_data(task, branch))?;
            ui::print_plan(&plan);
            Ok(())
        }
        Command::Status => status(&config),
        Command::Check => check(&config),
    }
}
