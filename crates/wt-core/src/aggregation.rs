//! Exact watch-time aggregation.
//!
//! # Algorithm Summary
//!
//! 1. Clamp every interval to the requested window, dropping malformed rows
//!    (inverted timestamps or a backwards position range)
//! 2. Group by `(key, session)`; concurrent sessions are never merged
//! 3. Coalesce each group's spans so overlapping samples count once
//! 4. Cap each session at a multiple of the item's runtime when it is known
//! 5. Sum capped session totals per key
//!
//! The cap bounds legacy fallback intervals the maintenance jobs have not
//! cleaned yet.

use std::collections::{BTreeMap, HashMap};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::merge::{Span, coalesced_seconds, raw_seconds};
use crate::types::{GroupBy, TimeWindow, ValidationError};
use crate::units::{Ticks, seconds_to_hours};

/// Configuration for watch-time aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// A session never counts for more than this multiple of the item's runtime.
    /// Default: 1.5.
    pub runtime_cap_factor: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            runtime_cap_factor: 1.5,
        }
    }
}

impl AggregationConfig {
    /// Rejects factors that would let the cap shrink real watch time or be meaningless.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.runtime_cap_factor.is_finite() || self.runtime_cap_factor < 1.0 {
            return Err(ValidationError::OutOfRange {
                name: "runtime_cap_factor",
                expected: "a finite number >= 1.0",
                value: self.runtime_cap_factor,
            });
        }
        Ok(())
    }
}

/// Which session an interval belongs to, for merge grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SessionRef {
    /// A persisted `play_sessions` row.
    Persisted(i64),
    /// An interval with no owning session, identified by its own row id.
    /// It never merges with anything else.
    Detached(i64),
    /// An open segment whose session has not been persisted yet.
    Live(String),
}

/// An interval suitable for aggregation.
///
/// Lets the algorithm run over stored rows, live segments and test fixtures alike.
pub trait WatchInterval {
    fn item_id(&self) -> &str;

    fn user_id(&self) -> &str;

    /// Series id or name for episodes, `None` for everything else.
    fn series_key(&self) -> Option<&str>;

    fn session(&self) -> SessionRef;

    fn start_ts(&self) -> i64;

    fn end_ts(&self) -> i64;

    /// Nominal runtime of the item, if the library knows it.
    fn runtime_ticks(&self) -> Option<Ticks>;

    /// Playback positions `(start, end)`, `None` when they are not tracked.
    fn positions(&self) -> Option<(Ticks, Ticks)> {
        None
    }

    /// True for `end_ts <= start_ts` or a position range that runs backwards.
    fn is_malformed(&self) -> bool {
        self.end_ts() <= self.start_ts()
            || self
                .positions()
                .is_some_and(|(start_pos, end_pos)| end_pos < start_pos)
    }

    /// The key this interval is summed under for `group_by`.
    fn group_key(&self, group_by: GroupBy) -> Option<&str> {
        match group_by {
            GroupBy::Item => Some(self.item_id()),
            GroupBy::User => Some(self.user_id()),
            GroupBy::Series => self.series_key().filter(|key| !key.trim().is_empty()),
        }
    }
}

impl<T: WatchInterval + ?Sized> WatchInterval for &T {
    fn item_id(&self) -> &str {
        (**self).item_id()
    }

    fn user_id(&self) -> &str {
        (**self).user_id()
    }

    fn series_key(&self) -> Option<&str> {
        (**self).series_key()
    }

    fn session(&self) -> SessionRef {
        (**self).session()
    }

    fn start_ts(&self) -> i64 {
        (**self).start_ts()
    }

    fn end_ts(&self) -> i64 {
        (**self).end_ts()
    }

    fn runtime_ticks(&self) -> Option<Ticks> {
        (**self).runtime_ticks()
    }

    fn positions(&self) -> Option<(Ticks, Ticks)> {
        (**self).positions()
    }
}

/// Watch time credited to one session under one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionTotal {
    pub key: String,
    pub session: SessionRef,
    /// Naive sum of the clamped interval lengths.
    pub raw_seconds: i64,
    /// Clamped intervals after coalescing.
    pub merged_seconds: i64,
    /// What the session contributes after the runtime cap.
    pub credited_seconds: f64,
    /// True when the runtime cap reduced the session.
    pub capped: bool,
}

/// Aggregate watch time for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyTotal {
    pub key: String,
    pub seconds: f64,
    pub hours: f64,
    pub sessions: usize,
    pub capped_sessions: usize,
}

/// Result of an aggregation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchTotals {
    pub group_by: GroupBy,
    pub window: TimeWindow,
    /// Sorted by seconds descending, then key ascending.
    pub totals: Vec<KeyTotal>,
    /// Rows with `end_ts <= start_ts` or `end_pos < start_pos`.
    pub dropped_malformed: usize,
}

impl WatchTotals {
    /// Watched hours per key.
    pub fn hours_by_key(&self) -> BTreeMap<String, f64> {
        self.totals
            .iter()
            .map(|total| (total.key.clone(), total.hours))
            .collect()
    }

    /// Seconds credited to `key`, zero if it has none.
    pub fn seconds_for(&self, key: &str) -> f64 {
        self.totals
            .iter()
            .find(|total| total.key == key)
            .map_or(0.0, |total| total.seconds)
    }

    pub fn total_seconds(&self) -> f64 {
        self.totals.iter().map(|total| total.seconds).sum()
    }

    /// Keeps only the top `limit` keys.
    pub fn truncate(&mut self, limit: usize) {
        self.totals.truncate(limit);
    }
}

#[derive(Debug, Default)]
struct SessionGroup {
    spans: Vec<Span>,
    runtime: Option<Ticks>,
}

/// Computes per-session watch time for every `(key, session)` group in the window.
///
/// Results are sorted by key then session so callers get a stable order.
pub fn session_totals<I: WatchInterval>(
    intervals: &[I],
    group_by: GroupBy,
    window: TimeWindow,
    config: &AggregationConfig,
) -> (Vec<SessionTotal>, usize) {
    let mut groups: HashMap<(String, SessionRef), SessionGroup> = HashMap::new();
    let mut dropped_malformed = 0;

    for interval in intervals {
        if interval.is_malformed() {
            dropped_malformed += 1;
            continue;
        }
        let (start, end) = (interval.start_ts(), interval.end_ts());
        let Some(key) = interval.group_key(group_by) else {
            continue;
        };
        let Some((clamped_start, clamped_end)) = window.clamp(start, end) else {
            continue;
        };

        let group = groups
            .entry((key.to_string(), interval.session()))
            .or_default();
        group.spans.push(Span::new(clamped_start, clamped_end));
        if let Some(runtime) = interval.runtime_ticks().filter(|r| r.is_positive()) {
            group.runtime = Some(group.runtime.map_or(runtime, |known| known.max(runtime)));
        }
    }

    if dropped_malformed > 0 {
        tracing::debug!(dropped_malformed, "dropped malformed intervals");
    }

    let cap_factor = config.runtime_cap_factor;
    let mut totals: Vec<SessionTotal> = groups
        .into_par_iter()
        .map(|((key, session), group)| {
            let merged = coalesced_seconds(&group.spans);
            let (credited, capped) = apply_runtime_cap(merged, group.runtime, cap_factor);
            SessionTotal {
                key,
                session,
                raw_seconds: raw_seconds(&group.spans),
                merged_seconds: merged,
                credited_seconds: credited,
                capped,
            }
        })
        .collect();
    totals.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.session.cmp(&b.session)));

    (totals, dropped_malformed)
}

/// Aggregates watch time per key over `window`.
pub fn aggregate_watch_time<I: WatchInterval>(
    intervals: &[I],
    group_by: GroupBy,
    window: TimeWindow,
    config: &AggregationConfig,
) -> WatchTotals {
    let (sessions, dropped_malformed) = session_totals(intervals, group_by, window, config);

    let mut by_key: BTreeMap<String, KeyTotal> = BTreeMap::new();
    for session in &sessions {
        let entry = by_key
            .entry(session.key.clone())
            .or_insert_with(|| KeyTotal {
                key: session.key.clone(),
                seconds: 0.0,
                hours: 0.0,
                sessions: 0,
                capped_sessions: 0,
            });
        entry.seconds += session.credited_seconds;
        entry.sessions += 1;
        if session.capped {
            entry.capped_sessions += 1;
        }
    }

    let mut totals: Vec<KeyTotal> = by_key
        .into_values()
        .filter(|total| total.seconds > 0.0)
        .map(|mut total| {
            total.hours = seconds_to_hours(total.seconds);
            total
        })
        .collect();
    totals.sort_by(|a, b| {
        b.seconds
            .total_cmp(&a.seconds)
            .then_with(|| a.key.cmp(&b.key))
    });

    tracing::debug!(
        intervals = intervals.len(),
        sessions = sessions.len(),
        keys = totals.len(),
        %group_by,
        %window,
        "aggregated watch time"
    );

    WatchTotals {
        group_by,
        window,
        totals,
        dropped_malformed,
    }
}

/// Returns the seconds a session is credited with and whether the cap applied.
#[allow(clippy::cast_precision_loss)]
fn apply_runtime_cap(merged_seconds: i64, runtime: Option<Ticks>, factor: f64) -> (f64, bool) {
    let merged = merged_seconds as f64;
    match runtime {
        Some(runtime) => {
            let cap = runtime.as_secs_f64() * factor;
            if merged > cap {
                (cap, true)
            } else {
                (merged, false)
            }
        }
        None => (merged, false),
    }
}
