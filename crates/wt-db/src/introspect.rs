//! Read-only per-session breakdown of one item's intervals.

use std::collections::{BTreeMap, HashMap};

use rusqlite::OptionalExtension;
use serde::Serialize;
use wt_core::merge::{Span, coalesced_seconds, raw_seconds};
use wt_core::{
    AggregationConfig, GroupBy, ItemId, Predicate, SessionRef, Ticks, TimeWindow, WatchInterval,
    session_totals,
};

use crate::store::{DEFAULT_BATCH_SIZE, IntervalRow, Scope};
use crate::{Database, DbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntervalEntry {
    pub id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionBreakdown {
    pub session: SessionRef,
    pub session_id: Option<String>,
    pub user_id: String,
    pub intervals: Vec<IntervalEntry>,
    /// Naive sum of the raw interval lengths.
    pub sum_seconds: i64,
    /// Raw intervals after coalescing.
    pub coalesced_seconds: i64,
    /// What aggregation credits this session within the window.
    pub windowed_seconds: f64,
    pub capped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakdownTotals {
    pub sessions: usize,
    pub intervals: usize,
    pub sum_seconds: i64,
    pub coalesced_seconds: i64,
    pub windowed_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemBreakdown {
    pub item_id: String,
    /// Library name, or "unknown" when the item has no metadata.
    pub item_name: String,
    pub window: TimeWindow,
    pub runtime_seconds: Option<i64>,
    pub sessions: Vec<SessionBreakdown>,
    pub totals: BreakdownTotals,
}

impl Database {
    /// Explains how the watch time for `item` in `window` is computed.
    ///
    /// Rows with `end_ts < start_ts` are left out of the listing.
    pub fn item_interval_breakdown(
        &self,
        item: &ItemId,
        window: TimeWindow,
        config: &AggregationConfig,
    ) -> Result<ItemBreakdown, DbError> {
        config.validate()?;
        let rows: Vec<IntervalRow> = self
            .intervals_in_window(
                &Scope::Items(vec![item.clone()]),
                window,
                &Predicate::new(),
                DEFAULT_BATCH_SIZE,
            )?
            .into_iter()
            .filter(|row| row.end_ts >= row.start_ts)
            .collect();

        let (credited, _) = session_totals(&rows, GroupBy::Item, window, config);
        let credited: HashMap<SessionRef, (f64, bool)> = credited
            .into_iter()
            .map(|total| (total.session, (total.credited_seconds, total.capped)))
            .collect();

        let mut grouped: BTreeMap<SessionRef, Vec<&IntervalRow>> = BTreeMap::new();
        for row in &rows {
            grouped.entry(row.session()).or_default().push(row);
        }

        let mut totals = BreakdownTotals::default();
        let mut sessions = Vec::with_capacity(grouped.len());
        for (session, rows) in grouped {
            let spans: Vec<Span> = rows
                .iter()
                .map(|row| Span::new(row.start_ts, row.end_ts))
                .collect();
            let (windowed_seconds, capped) =
                credited.get(&session).copied().unwrap_or((0.0, false));
            let breakdown = SessionBreakdown {
                session_id: rows[0].session_id.clone(),
                user_id: rows[0].user_id.clone(),
                intervals: rows
                    .iter()
                    .map(|row| IntervalEntry {
                        id: row.id,
                        start_ts: row.start_ts,
                        end_ts: row.end_ts,
                    })
                    .collect(),
                sum_seconds: raw_seconds(&spans),
                coalesced_seconds: coalesced_seconds(&spans),
                windowed_seconds,
                capped,
                session,
            };

            totals.sessions += 1;
            totals.intervals += breakdown.intervals.len();
            totals.sum_seconds = totals.sum_seconds.saturating_add(breakdown.sum_seconds);
            totals.coalesced_seconds = totals
                .coalesced_seconds
                .saturating_add(breakdown.coalesced_seconds);
            totals.windowed_seconds += breakdown.windowed_seconds;
            sessions.push(breakdown);
        }

        let (item_name, runtime) = self.item_metadata(item)?;
        Ok(ItemBreakdown {
            item_id: item.to_string(),
            item_name: item_name.unwrap_or_else(|| "unknown".to_string()),
            window,
            runtime_seconds: runtime.map(|ticks| Ticks::new(ticks).to_seconds().get()),
            sessions,
            totals,
        })
    }

    fn item_metadata(&self, item: &ItemId) -> Result<(Option<String>, Option<i64>), DbError> {
        let metadata = self
            .conn
            .query_row(
                "SELECT name, run_time_ticks FROM library_item WHERE id = ?",
                [item.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(metadata.unwrap_or((None, None)))
    }
}
