//! Watch-time report command.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use wt_core::{Column, GroupBy, ItemId, NoLiveSource, Predicate, UserId, WatchTotals};
use wt_db::{Database, Scope, WatchTimeRequest};

use super::util::{WindowArgs, format_duration};
use crate::Config;

#[derive(Debug, Args)]
pub struct WatchTimeArgs {
    /// Key to sum watch time under.
    #[arg(long, default_value = "item")]
    pub by: GroupBy,

    /// Only count these items (repeatable).
    #[arg(long)]
    pub item: Vec<String>,

    /// Only count these users (repeatable).
    #[arg(long)]
    pub user: Vec<String>,

    /// Report the last N days [default: 30].
    #[arg(long, conflicts_with_all = ["all_time", "start", "end"])]
    pub days: Option<u32>,

    /// Report everything ever recorded.
    #[arg(long, conflicts_with_all = ["start", "end"])]
    pub all_time: bool,

    /// Window start: RFC 3339, unix seconds, or e.g. "2 days ago".
    #[arg(long)]
    pub start: Option<String>,

    /// Window end: RFC 3339, unix seconds, or e.g. "1 hour ago".
    #[arg(long)]
    pub end: Option<String>,

    /// Only count these media types (repeatable).
    #[arg(long)]
    pub media_type: Vec<String>,

    /// Count live TV even when the config excludes it.
    #[arg(long)]
    pub include_live_tv: bool,

    /// Show only the top N keys.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl WatchTimeArgs {
    fn window_args(&self) -> WindowArgs {
        WindowArgs {
            days: self.days,
            all_time: self.all_time,
            start: self.start.clone(),
            end: self.end.clone(),
        }
    }
}

/// Builds the aggregation request from flags and configuration.
///
/// Items take the indexed scope; users become the scope only when no items
/// are named, otherwise they narrow the items through the filter.
pub fn build_request(
    args: &WatchTimeArgs,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<WatchTimeRequest> {
    let window = args.window_args().resolve(now)?;
    let mut request = WatchTimeRequest::new(args.by, window);

    let items = args
        .item
        .iter()
        .map(ItemId::new)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --item")?;
    let users = args
        .user
        .iter()
        .map(UserId::new)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --user")?;

    let mut filter = Predicate::new();
    if !items.is_empty() {
        request.scope = Scope::Items(items);
        if !users.is_empty() {
            filter = filter.is_in(Column::UserId, users.iter().map(UserId::as_str));
        }
    } else if !users.is_empty() {
        request.scope = Scope::Users(users);
    }
    if !args.media_type.is_empty() {
        filter = filter.is_in(Column::MediaType, args.media_type.iter().map(String::as_str));
    }
    if config.aggregation.exclude_live_tv && !args.include_live_tv {
        filter = filter.exclude_live_tv();
    }

    request.filter = filter;
    request.config = config.aggregation.aggregation_config();
    request.batch_size = config.aggregation.batch_size;
    request.limit = args.limit;
    Ok(request)
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    config: &Config,
    args: &WatchTimeArgs,
) -> Result<()> {
    let request = build_request(args, config, Utc::now())?;
    let totals = db
        .aggregate_watch_time(&request, &NoLiveSource)
        .context("failed to aggregate watch time")?;

    if args.json {
        writeln!(writer, "{}", serde_json::to_string_pretty(&totals)?)?;
    } else {
        write!(writer, "{}", format_report(&totals))?;
    }
    Ok(())
}

/// Renders totals as a plain-text table.
pub fn format_report(totals: &WatchTotals) -> String {
    let mut output = format!("Watch time by {} in {}\n", totals.group_by, totals.window);
    if totals.totals.is_empty() {
        output.push_str("No watch time recorded.\n");
        return output;
    }

    let width = totals
        .totals
        .iter()
        .map(|total| total.key.chars().count())
        .max()
        .unwrap_or(0);
    for total in &totals.totals {
        let capped = if total.capped_sessions > 0 {
            format!(", {} capped", total.capped_sessions)
        } else {
            String::new()
        };
        output.push_str(&format!(
            "  {:<width$}  {:>8}  ({} sessions{capped})\n",
            total.key,
            format_duration(total.seconds),
            total.sessions,
        ));
    }
    output.push_str(&format!(
        "Total: {}\n",
        format_duration(totals.total_seconds())
    ));
    if totals.dropped_malformed > 0 {
        output.push_str(&format!(
            "Skipped {} malformed intervals\n",
            totals.dropped_malformed
        ));
    }
    output
}
