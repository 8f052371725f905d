//! Maintenance command for repairing the interval table.

use std::io::Write;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use wt_db::{Database, JobMode, JobReport, MaintenanceConfig, MaintenanceOp};

use crate::Config;

#[derive(Debug, Args)]
pub struct MaintainArgs {
    #[command(subcommand)]
    pub job: MaintainJob,

    /// Report what would change without writing.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Output as JSON.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum MaintainJob {
    /// Keep only the newest of intervals sharing a session and start.
    Dedupe,
    /// Delete intervals that contain another interval of the same session.
    Supersets,
    /// Shrink coarse whole-session intervals to the span the playhead covered.
    FixFallback {
        /// Overrides `maintenance.fallback_slack_seconds`.
        #[arg(long)]
        slack_seconds: Option<i64>,
    },
    /// Rescale durations and positions stored in the wrong unit.
    FixUnits {
        /// Overrides `maintenance.unit_threshold_seconds`.
        #[arg(long)]
        threshold_seconds: Option<i64>,
    },
    /// Move session start times back to their earliest interval.
    BackfillStarted,
    /// Run every job in order.
    ///
    /// With --dry-run the jobs run chained in one rolled-back transaction,
    /// so the counts match what an applied run would report.
    All,
}

impl MaintainJob {
    const fn op(&self) -> Option<MaintenanceOp> {
        match self {
            Self::Dedupe => Some(MaintenanceOp::Dedupe),
            Self::Supersets => Some(MaintenanceOp::RemoveSupersets),
            Self::FixFallback { .. } => Some(MaintenanceOp::FixFallback),
            Self::FixUnits { .. } => Some(MaintenanceOp::NormalizeUnits),
            Self::BackfillStarted => Some(MaintenanceOp::BackfillStarted),
            Self::All => None,
        }
    }

    fn apply_overrides(&self, mut config: MaintenanceConfig) -> MaintenanceConfig {
        match self {
            Self::FixFallback {
                slack_seconds: Some(slack),
            } => config.fallback_slack_seconds = *slack,
            Self::FixUnits {
                threshold_seconds: Some(threshold),
            } => config.unit_threshold_seconds = *threshold,
            _ => {}
        }
        config
    }
}

#[derive(Debug, Serialize)]
struct JobOutcome {
    operation: MaintenanceOp,
    #[serde(flatten)]
    report: JobReport,
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &mut Database,
    config: &Config,
    args: &MaintainArgs,
) -> Result<()> {
    let maintenance = args.job.apply_overrides(config.maintenance);
    let mode = JobMode::from_dry_run(args.dry_run);

    let outcomes: Vec<JobOutcome> = match args.job.op() {
        Some(op) => {
            let report = db
                .run_maintenance(op, mode, &maintenance)
                .with_context(|| format!("maintenance job {op} failed"))?;
            vec![JobOutcome {
                operation: op,
                report,
            }]
        }
        None => db
            .run_all_maintenance(mode, &maintenance)
            .context("maintenance run failed")?
            .into_iter()
            .map(|(operation, report)| JobOutcome { operation, report })
            .collect(),
    };

    if args.json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&outcomes)?)?;
    } else {
        for outcome in &outcomes {
            writeln!(writer, "{}", format_outcome(outcome.operation, &outcome.report))?;
        }
    }
    Ok(())
}

fn format_outcome(op: MaintenanceOp, report: &JobReport) -> String {
    let suffix = if report.dry_run { " (dry run)" } else { "" };
    format!(
        "{op}: examined {}, changed {}, adjusted {}s{suffix}",
        report.candidates_examined, report.rows_changed, report.seconds_adjusted
    )
}
