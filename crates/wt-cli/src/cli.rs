//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::debug::DebugAction;
use crate::commands::jobs::JobsArgs;
use crate::commands::maintain::MaintainArgs;
use crate::commands::watch_time::WatchTimeArgs;

/// Watch-time ledger.
///
/// Consolidates raw playback intervals into exact per-item, per-user and
/// per-series watch time, and repairs the interval table in place.
#[derive(Debug, Parser)]
#[command(name = "wt", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show store counts.
    Status,

    /// Import sessions, intervals and library items as JSONL from stdin.
    Import,

    /// Report exact watch time.
    WatchTime(WatchTimeArgs),

    /// Run a corrective maintenance job.
    Maintain(MaintainArgs),

    /// List recent maintenance runs.
    Jobs(JobsArgs),

    /// Inspect how watch time is computed.
    Debug {
        #[command(subcommand)]
        action: DebugAction,
    },
}
