//! Debug views over the raw interval data.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;

use wt_core::{ItemId, TimeWindow};
use wt_db::Database;

use crate::Config;

#[derive(Debug, Subcommand)]
pub enum DebugAction {
    /// Print an item's intervals per session with raw and merged totals.
    ItemIntervals {
        /// Library item id.
        item: String,

        /// Look back this many days (0 for all time).
        #[arg(long, default_value_t = 14)]
        days: u32,
    },
}

pub fn run<W: Write>(
    writer: &mut W,
    db: &Database,
    config: &Config,
    action: &DebugAction,
) -> Result<()> {
    match action {
        DebugAction::ItemIntervals { item, days } => {
            let item = ItemId::new(item.as_str()).context("invalid item id")?;
            let window = TimeWindow::last_days(Utc::now(), *days);
            let breakdown = db.item_interval_breakdown(
                &item,
                window,
                &config.aggregation.aggregation_config(),
            )?;
            writeln!(writer, "{}", serde_json::to_string_pretty(&breakdown)?)?;
        }
    }
    Ok(())
}
