//! Lists the maintenance audit log.

use std::io::Write;

use anyhow::Result;
use clap::Args;

use wt_db::{Database, JobRecord};

#[derive(Debug, Args)]
pub struct JobsArgs {
    /// Number of runs to show.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run<W: Write>(writer: &mut W, db: &Database, args: &JobsArgs) -> Result<()> {
    let jobs = db.list_jobs(args.limit)?;

    if args.json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&jobs)?)?;
        return Ok(());
    }

    if jobs.is_empty() {
        writeln!(writer, "No maintenance runs recorded.")?;
        return Ok(());
    }
    for job in &jobs {
        writeln!(writer, "{}", format_job(job))?;
    }
    Ok(())
}

fn format_job(job: &JobRecord) -> String {
    let mode = if job.dry_run { " dry-run" } else { "" };
    let mut line = format!(
        "{} {} {}{mode} examined={} changed={} adjusted={}s",
        job.started_at,
        job.operation,
        job.status,
        job.candidates_examined,
        job.rows_changed,
        job.seconds_adjusted
    );
    if let Some(error) = job
        .summary
        .as_ref()
        .and_then(|summary| summary.get("error"))
        .and_then(serde_json::Value::as_str)
    {
        line.push_str(" error: ");
        line.push_str(error);
    }
    line
}
