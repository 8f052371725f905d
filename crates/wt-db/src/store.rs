//! Windowed interval reads.
//!
//! The single read path for aggregation, introspection and maintenance
//! runtime lookups. Business rules live in `wt_core`; this module only fetches.

use std::collections::{BTreeSet, HashMap};

use rusqlite::ToSql;
use wt_core::filter::CompiledFilter;
use wt_core::{
    AggregationConfig, GroupBy, ItemId, LiveSegment, LiveWatchTimeSource, Predicate, Seconds,
    SessionRef, Ticks, TimeWindow, UserId, WatchInterval, WatchTotals, aggregate_watch_time,
};

use crate::{Database, DbError};

/// Default number of keys bound per query.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Which intervals a read covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Items(Vec<ItemId>),
    Users(Vec<UserId>),
}

impl Scope {
    const fn column(&self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Items(_) => Some("pi.item_id"),
            Self::Users(_) => Some("pi.user_id"),
        }
    }

    /// Distinct keys, sorted.
    fn keys(&self) -> Vec<String> {
        let keys: BTreeSet<&str> = match self {
            Self::All => BTreeSet::new(),
            Self::Items(items) => items.iter().map(ItemId::as_str).collect(),
            Self::Users(users) => users.iter().map(UserId::as_str).collect(),
        };
        keys.into_iter().map(String::from).collect()
    }

    fn admits(&self, item_id: &str, user_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Items(items) => items.iter().any(|item| item.as_str() == item_id),
            Self::Users(users) => users.iter().any(|user| user.as_str() == user_id),
        }
    }
}

/// An interval joined to its session and library metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalRow {
    pub id: i64,
    pub session_fk: Option<i64>,
    /// Source session identifier, if the interval has a session.
    pub session_id: Option<String>,
    pub item_id: String,
    pub user_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_pos_ticks: Ticks,
    pub end_pos_ticks: Ticks,
    pub duration_seconds: Seconds,
    pub item_name: Option<String>,
    pub media_type: Option<String>,
    /// Series id, falling back to series name.
    pub series_key: Option<String>,
    pub runtime_ticks: Option<Ticks>,
}

impl WatchInterval for IntervalRow {
    fn item_id(&self) -> &str {
        &self.item_id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn series_key(&self) -> Option<&str> {
        self.series_key.as_deref()
    }

    fn session(&self) -> SessionRef {
        self.session_fk
            .map_or(SessionRef::Detached(self.id), SessionRef::Persisted)
    }

    fn start_ts(&self) -> i64 {
        self.start_ts
    }

    fn end_ts(&self) -> i64 {
        self.end_ts
    }

    fn runtime_ticks(&self) -> Option<Ticks> {
        self.runtime_ticks
    }

    fn positions(&self) -> Option<(Ticks, Ticks)> {
        Some((self.start_pos_ticks, self.end_pos_ticks))
    }
}

/// Parameters for a watch-time report.
#[derive(Debug, Clone)]
pub struct WatchTimeRequest {
    pub scope: Scope,
    pub group_by: GroupBy,
    pub window: TimeWindow,
    pub filter: Predicate,
    pub config: AggregationConfig,
    pub batch_size: usize,
    pub limit: Option<usize>,
}

impl WatchTimeRequest {
    pub fn new(group_by: GroupBy, window: TimeWindow) -> Self {
        Self {
            scope: Scope::All,
            group_by,
            window,
            filter: Predicate::new(),
            config: AggregationConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            limit: None,
        }
    }
}

const SERIES_KEY_EXPR: &str = "NULLIF(COALESCE(NULLIF(li.series_id, ''), li.series_name), '')";

impl Database {
    /// Returns every interval overlapping `window` within `scope`, ordered by id.
    ///
    /// Unknown items and intervals without a session are included.
    pub fn intervals_in_window(
        &self,
        scope: &Scope,
        window: TimeWindow,
        filter: &Predicate,
        batch_size: usize,
    ) -> Result<Vec<IntervalRow>, DbError> {
        if batch_size == 0 {
            return Err(DbError::InvalidParameter {
                name: "batch_size",
                value: 0,
            });
        }
        let compiled = filter.compile()?;

        let mut rows = match scope.column() {
            None => self.fetch_intervals(window, None, &[], &compiled)?,
            Some(column) => {
                let keys = scope.keys();
                let mut rows = Vec::new();
                for batch in keys.chunks(batch_size) {
                    rows.extend(self.fetch_intervals(window, Some(column), batch, &compiled)?);
                }
                rows
            }
        };
        rows.sort_by_key(|row| row.id);

        tracing::debug!(rows = rows.len(), %window, "fetched intervals");
        Ok(rows)
    }

    fn fetch_intervals(
        &self,
        window: TimeWindow,
        key_column: Option<&str>,
        keys: &[String],
        filter: &CompiledFilter,
    ) -> Result<Vec<IntervalRow>, DbError> {
        let key_clause = key_column.map_or_else(String::new, |column| {
            let placeholders = vec!["?"; keys.len()].join(", ");
            format!(" AND {column} IN ({placeholders})")
        });
        let sql = format!(
            "
            SELECT pi.id, pi.session_fk, ps.session_id, pi.item_id, pi.user_id,
                   pi.start_ts, pi.end_ts, pi.start_pos_ticks, pi.end_pos_ticks,
                   pi.duration_seconds, li.name, li.media_type, {SERIES_KEY_EXPR},
                   li.run_time_ticks
            FROM play_intervals pi
            LEFT JOIN play_sessions ps ON ps.id = pi.session_fk
            LEFT JOIN library_item li ON li.id = pi.item_id
            WHERE pi.start_ts < ? AND pi.end_ts > ?{key_clause}{}
            ",
            filter.and_clause()
        );

        let window_end = window.end();
        let window_start = window.start();
        let mut params: Vec<&dyn ToSql> = vec![&window_end, &window_start];
        params.extend(keys.iter().map(|key| key as &dyn ToSql));
        params.extend(filter.params.iter().map(|param| param as &dyn ToSql));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| {
            Ok(IntervalRow {
                id: row.get(0)?,
                session_fk: row.get(1)?,
                session_id: row.get(2)?,
                item_id: row.get(3)?,
                user_id: row.get(4)?,
                start_ts: row.get(5)?,
                end_ts: row.get(6)?,
                start_pos_ticks: Ticks::new(row.get(7)?),
                end_pos_ticks: Ticks::new(row.get(8)?),
                duration_seconds: Seconds::new(row.get(9)?),
                item_name: row.get(10)?,
                media_type: row.get(11)?,
                series_key: row.get(12)?,
                runtime_ticks: row
                    .get::<_, Option<i64>>(13)?
                    .map(Ticks::new)
                    .filter(|ticks| ticks.is_positive()),
            })
        })?;
        let mut intervals = Vec::new();
        for row in rows {
            intervals.push(row?);
        }
        Ok(intervals)
    }

    /// Computes exact watch time, blending in open segments from `live`.
    pub fn aggregate_watch_time(
        &self,
        request: &WatchTimeRequest,
        live: &dyn LiveWatchTimeSource,
    ) -> Result<WatchTotals, DbError> {
        request.config.validate()?;
        let rows = self.intervals_in_window(
            &request.scope,
            request.window,
            &request.filter,
            request.batch_size,
        )?;
        let segments = self.admitted_live_segments(request, live.open_segments())?;

        let intervals: Vec<&dyn WatchInterval> = rows
            .iter()
            .map(|row| row as &dyn WatchInterval)
            .chain(segments.iter().map(|segment| segment as &dyn WatchInterval))
            .collect();

        let mut totals = aggregate_watch_time(
            &intervals,
            request.group_by,
            request.window,
            &request.config,
        );
        if let Some(limit) = request.limit {
            totals.truncate(limit);
        }
        Ok(totals)
    }

    /// Keeps the live segments the request's scope and filter admit, filling
    /// missing runtime and series from the library.
    fn admitted_live_segments(
        &self,
        request: &WatchTimeRequest,
        segments: Vec<LiveSegment>,
    ) -> Result<Vec<LiveSegment>, DbError> {
        let segments: Vec<LiveSegment> = segments
            .into_iter()
            .filter(|segment| request.scope.admits(&segment.item_id, &segment.user_id))
            .collect();
        if segments.is_empty() {
            return Ok(segments);
        }

        let pairs: BTreeSet<(&str, &str)> = segments
            .iter()
            .map(|segment| (segment.item_id.as_str(), segment.user_id.as_str()))
            .collect();
        let compiled = request.filter.compile()?;
        let mut admitted: HashMap<(String, String), (Option<Ticks>, Option<String>)> =
            HashMap::new();

        let pairs: Vec<(&str, &str)> = pairs.into_iter().collect();
        for batch in pairs.chunks(request.batch_size.max(1)) {
            let values = vec!["(?, ?)"; batch.len()].join(", ");
            let sql = format!(
                "
                WITH pi(item_id, user_id) AS (VALUES {values})
                SELECT pi.item_id, pi.user_id, li.run_time_ticks, {SERIES_KEY_EXPR}
                FROM pi
                LEFT JOIN library_item li ON li.id = pi.item_id
                WHERE 1{}
                ",
                compiled.and_clause()
            );
            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(batch.len() * 2);
            for (item_id, user_id) in batch {
                params.push(item_id);
                params.push(user_id);
            }
            params.extend(compiled.params.iter().map(|param| param as &dyn ToSql));

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params.as_slice(), |row| {
                Ok((
                    (row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    (
                        row.get::<_, Option<i64>>(2)?
                            .map(Ticks::new)
                            .filter(|ticks| ticks.is_positive()),
                        row.get::<_, Option<String>>(3)?,
                    ),
                ))
            })?;
            for row in rows {
                let (key, metadata) = row?;
                admitted.insert(key, metadata);
            }
        }

        let segments: Vec<LiveSegment> = segments
            .into_iter()
            .filter_map(|mut segment| {
                let (runtime, series) = admitted
                    .get(&(segment.item_id.clone(), segment.user_id.clone()))?
                    .clone();
                segment.runtime_ticks = segment.runtime_ticks.or(runtime);
                segment.series_key = segment.series_key.or(series);
                Some(segment)
            })
            .collect();
        tracing::debug!(segments = segments.len(), "blended live segments");
        Ok(segments)
    }
}
