//! Command line interface (clap derive).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// braid: classify work items, run them on capable workers and merge the results.
#[derive(Debug, Parser)]
#[command(name = "braid", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file.
    #[arg(long, global = true, default_value = "braid.toml")]
    pub config: PathBuf,

    /// Directory holding the persisted board, artifacts and batch history.
    #[arg(long, global = true, default_value = ".braid")]
    pub state_dir: PathBuf,

    /// Print reports as JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Debug-level logging (RUST_LOG still wins when set).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest task sources (if any) and run one batch.
    RunBatch {
        /// Source files; units inside a file are separated by `---` lines. `-` reads stdin.
        sources: Vec<PathBuf>,
    },

    /// Show task counts, worker capacity and remaining work.
    Status,

    /// Ask the running batch to stop dispatching.
    CancelBatch,

    /// Change a task's scores.
    Rescore {
        task: String,
        #[arg(long)]
        impact: u32,
        #[arg(long)]
        effort: u32,
        #[arg(long)]
        risk: u32,
    },

    /// Send a Deferred task back to Ready (e.g. after manual review).
    Release { task: String },
}
