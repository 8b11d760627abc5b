//! braid CLI
//!
//! Exit codes: 0 = clean batch, 1 = partial (failures / deferrals / errors),
//! 2 = fatal (rollback, bad configuration, unreadable state).

mod cli;
mod command_executor;
mod sources;
mod state;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use braid_core::config::WorkerConfig;
use braid_core::domain::{Score, TaskId};
use braid_core::impls::{InMemoryArtifactStore, TracingSink};
use braid_core::routing::WorkerLoad;
use braid_core::{cancellation, BraidError, CancelHandle, Engine, EngineConfig, Executor, StatusReport};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::{Cli, Command};
use crate::command_executor::CommandExecutor;
use crate::state::{PersistedState, StateDir};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);
const FATAL_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    telemetry::init(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(FATAL_EXIT)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let state_dir = StateDir::new(&cli.state_dir);
    match cli.command {
        Command::RunBatch { ref sources } => run_batch(&cli, &state_dir, sources).await,
        Command::Status => status(&cli, &state_dir).await,
        Command::CancelBatch => {
            if state_dir.request_cancel()? {
                println!("cancel requested");
                Ok(0)
            } else {
                println!("no batch is running");
                Ok(1)
            }
        }
        Command::Rescore {
            ref task,
            impact,
            effort,
            risk,
        } => {
            let (impact, effort, risk) = (Score::new(impact)?, Score::new(effort)?, Score::new(risk)?);
            let id = TaskId::new(task.as_str());
            update_board(&state_dir, |parts| parts.board.rescore(&id, impact, effort, risk)).await?;
            info!(task = %id, "rescored");
            Ok(0)
        }
        Command::Release { ref task } => {
            let id = TaskId::new(task.as_str());
            update_board(&state_dir, |parts| parts.board.release(&id)).await?;
            info!(task = %id, "released");
            Ok(0)
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))
}

fn executor_for(worker: &WorkerConfig) -> Result<Arc<dyn Executor>, BraidError> {
    let command = worker.command.as_deref().unwrap_or_default();
    match CommandExecutor::new(command) {
        Some(executor) => Ok(Arc::new(executor)),
        None => Err(BraidError::Config(format!("worker {} has no command", worker.id))),
    }
}

async fn run_batch(cli: &Cli, state_dir: &StateDir, sources: &[std::path::PathBuf]) -> Result<u8> {
    let config = load_config(cli)?;
    let _running = state_dir.begin_batch()?;

    let persisted = state_dir.load().await?;
    let mut engine = Engine::from_config(
        &config,
        InMemoryArtifactStore::new(),
        Arc::new(TracingSink),
        executor_for,
    )?
    .with_parts(persisted.into_parts());

    let units = sources::read_sources(sources).await?;
    if !units.is_empty() {
        let intake = engine.intake(&units)?;
        info!(
            tasks = intake.tasks.len(),
            warnings = intake.warnings.len(),
            errors = intake.errors.len(),
            "sources classified"
        );
    }

    let (handle, signal) = cancellation();
    let watcher = tokio::spawn(watch_cancel(state_dir.clone(), handle));
    let result = engine.run_batch(signal).await;
    watcher.abort();

    // rollback でも board は更新されている（task は Ready に戻る）ので保存する
    state_dir
        .save(&PersistedState::from_parts(engine.into_parts()))
        .await?;
    let report = result?;

    print_report(cli.json, &report, |r| r.render_text())?;
    Ok(exit_code(report.exit_code()))
}

async fn watch_cancel(state_dir: StateDir, handle: CancelHandle) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(CANCEL_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("interrupted, cancelling batch");
                handle.cancel();
                return;
            }
            _ = tick.tick() => {
                if state_dir.cancel_requested().await {
                    info!("cancel-batch requested");
                    handle.cancel();
                    return;
                }
            }
        }
    }
}

async fn status(cli: &Cli, state_dir: &StateDir) -> Result<u8> {
    let config = load_config(cli)?;
    let parts = state_dir.load().await?.into_parts();
    let workers = config
        .workers
        .iter()
        .map(|w| WorkerLoad {
            id: w.id.clone(),
            current_load: 0,
            max_concurrent: w.max_concurrent,
        })
        .collect();
    let report = StatusReport::from_board(
        &parts.board,
        workers,
        parts.history.last().map(|r| r.batch_id),
    );
    print_report(cli.json, &report, |r| r.render_text())?;
    Ok(0)
}

async fn update_board(
    state_dir: &StateDir,
    update: impl FnOnce(&mut braid_core::EngineParts<InMemoryArtifactStore>) -> Result<(), BraidError>,
) -> Result<()> {
    // batch 実行中に書き換えると保存時に上書きされる
    anyhow::ensure!(!state_dir.is_running(), "a batch is running; try again after it finishes");
    let mut parts = state_dir.load().await?.into_parts();
    update(&mut parts)?;
    state_dir.save(&PersistedState::from_parts(parts)).await
}

fn print_report<R: Serialize>(json: bool, report: &R, text: impl FnOnce(&R) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", text(report));
    }
    Ok(())
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(FATAL_EXIT)
}
