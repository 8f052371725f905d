//! Storage layer for the watch-time ledger.
//!
//! Provides persistence for playback sessions, playback intervals, library
//! metadata and the maintenance audit log using `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A `Database` instance can be moved between threads but cannot be shared
//! across threads without external synchronization. Concurrent callers open
//! separate connections; SQLite transactions keep readers from ever observing
//! a half-applied maintenance job.
//!
//! # Schema
//!
//! ## Time Units
//!
//! Wall-clock columns (`started_at`, `ended_at`, `start_ts`, `end_ts`) are unix
//! seconds. Media positions and runtimes (`*_pos_ticks`, `run_time_ticks`) are
//! 100-nanosecond ticks. Maintenance timestamps are ISO 8601 text.
//!
//! ## Raw Data
//!
//! Interval rows are stored exactly as observed. Rows may overlap, duplicate one
//! another, be inverted, or carry values in the wrong unit. The aggregation
//! read path tolerates all of these; the jobs in [`maintenance`] repair them.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wt_core::{ItemId, PlayMethod, Seconds, SessionId, Ticks, UnitError, UserId, ValidationError};

pub mod audit;
pub mod introspect;
pub mod maintenance;
pub mod store;

pub use audit::{JobRecord, JobStatus};
pub use introspect::{BreakdownTotals, IntervalEntry, ItemBreakdown, SessionBreakdown};
pub use maintenance::{JobMode, JobReport, MaintenanceConfig, MaintenanceOp};
pub use store::{IntervalRow, Scope, WatchTimeRequest};

/// Default time a connection waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A request carried an invalid domain value.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A unit conversion overflowed.
    #[error(transparent)]
    Unit(#[from] UnitError),
    /// A tuning parameter was out of range.
    #[error("invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: i64 },
    /// An interval referenced a session that has not been recorded.
    #[error("unknown session {session_id} for item {item_id}")]
    UnknownSession { session_id: String, item_id: String },
    /// A stored maintenance job row could not be read back.
    #[error("invalid maintenance job {job_id}: {message}")]
    InvalidJobRecord { job_id: String, message: String },
    /// Failed to encode or decode a job summary.
    #[error("invalid job summary: {0}")]
    Json(#[from] serde_json::Error),
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A playback session as reported by the ingestion side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub device_id: Option<String>,
    pub client_name: Option<String>,
    pub play_method: Option<PlayMethod>,
    pub video_method: Option<String>,
    pub audio_method: Option<String>,
    pub video_codec_from: Option<String>,
    pub video_codec_to: Option<String>,
    pub audio_codec_from: Option<String>,
    pub audio_codec_to: Option<String>,
    #[serde(default)]
    pub transcode_reasons: Vec<String>,
    pub started_at: i64,
}

/// An observed playback segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRecord {
    /// Source session identifier. `None` records an interval with no session.
    pub session_id: Option<SessionId>,
    pub item_id: ItemId,
    pub user_id: UserId,
    pub start_ts: i64,
    pub end_ts: i64,
    #[serde(default)]
    pub start_pos_ticks: Ticks,
    #[serde(default)]
    pub end_pos_ticks: Ticks,
    /// Stored as reported. Derived from the timestamps when absent.
    pub duration_seconds: Option<Seconds>,
    #[serde(default)]
    pub seeked: bool,
}

/// Library metadata for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub name: Option<String>,
    pub media_type: Option<String>,
    pub series_id: Option<String>,
    pub series_name: Option<String>,
    pub run_time_ticks: Option<Ticks>,
    pub server_id: Option<String>,
    pub server_type: Option<String>,
}

/// Row counts for `wt status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub active_sessions: i64,
    pub closed_sessions: i64,
    pub intervals: i64,
    pub malformed_intervals: i64,
    pub detached_intervals: i64,
    pub items: i64,
    pub maintenance_runs: i64,
    pub last_maintenance_at: Option<String>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens a database, waiting up to `busy_timeout` for locks held by other connections.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS library_item (
                id TEXT PRIMARY KEY,
                name TEXT,
                media_type TEXT,
                series_id TEXT,
                series_name TEXT,
                run_time_ticks INTEGER,
                server_id TEXT,
                server_type TEXT
            );

            -- One continuous playback attempt.
            -- started_at/ended_at: unix seconds; ended_at is NULL while active
            -- transcode_reasons: comma separated tags
            CREATE TABLE IF NOT EXISTS play_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                device_id TEXT,
                client_name TEXT,
                play_method TEXT,
                video_method TEXT,
                audio_method TEXT,
                video_codec_from TEXT,
                video_codec_to TEXT,
                audio_codec_from TEXT,
                audio_codec_to TEXT,
                transcode_reasons TEXT,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (session_id, item_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_item ON play_sessions(item_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON play_sessions(user_id);

            -- Observed playback segments.
            -- start_ts/end_ts: unix seconds, half-open
            -- *_pos_ticks: media position in 100ns ticks
            CREATE TABLE IF NOT EXISTS play_intervals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_fk INTEGER,
                item_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                start_pos_ticks INTEGER NOT NULL DEFAULT 0,
                end_pos_ticks INTEGER NOT NULL DEFAULT 0,
                duration_seconds INTEGER NOT NULL DEFAULT 0,
                seeked INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (session_fk) REFERENCES play_sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_intervals_item_start ON play_intervals(item_id, start_ts);
            CREATE INDEX IF NOT EXISTS idx_intervals_session_start ON play_intervals(session_fk, start_ts);
            CREATE INDEX IF NOT EXISTS idx_intervals_user_start ON play_intervals(user_id, start_ts);

            CREATE TABLE IF NOT EXISTS maintenance_jobs (
                id TEXT PRIMARY KEY,
                operation TEXT NOT NULL,
                dry_run INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                candidates_examined INTEGER NOT NULL DEFAULT 0,
                rows_changed INTEGER NOT NULL DEFAULT 0,
                seconds_adjusted INTEGER NOT NULL DEFAULT 0,
                summary TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_maintenance_jobs_started ON maintenance_jobs(started_at);
            ",
        )?;
        Ok(())
    }

    /// Records a session, or refreshes it if `(session_id, item_id)` is already known.
    ///
    /// Refreshing a closed session reopens it. Returns the session row id.
    pub fn upsert_session(&mut self, session: &SessionRecord) -> Result<i64, DbError> {
        let reasons = (!session.transcode_reasons.is_empty())
            .then(|| session.transcode_reasons.join(","));
        let id = self.conn.query_row(
            "
            INSERT INTO play_sessions
            (session_id, user_id, item_id, device_id, client_name, play_method,
             video_method, audio_method, video_codec_from, video_codec_to,
             audio_codec_from, audio_codec_to, transcode_reasons, started_at, ended_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 1)
            ON CONFLICT(session_id, item_id) DO UPDATE SET
                user_id = excluded.user_id,
                device_id = COALESCE(excluded.device_id, play_sessions.device_id),
                client_name = COALESCE(excluded.client_name, play_sessions.client_name),
                play_method = COALESCE(excluded.play_method, play_sessions.play_method),
                video_method = COALESCE(excluded.video_method, play_sessions.video_method),
                audio_method = COALESCE(excluded.audio_method, play_sessions.audio_method),
                video_codec_from = COALESCE(excluded.video_codec_from, play_sessions.video_codec_from),
                video_codec_to = COALESCE(excluded.video_codec_to, play_sessions.video_codec_to),
                audio_codec_from = COALESCE(excluded.audio_codec_from, play_sessions.audio_codec_from),
                audio_codec_to = COALESCE(excluded.audio_codec_to, play_sessions.audio_codec_to),
                transcode_reasons = COALESCE(excluded.transcode_reasons, play_sessions.transcode_reasons),
                started_at = MIN(play_sessions.started_at, excluded.started_at),
                ended_at = NULL,
                is_active = 1
            RETURNING id
            ",
            params![
                session.session_id.as_str(),
                session.user_id.as_str(),
                session.item_id.as_str(),
                session.device_id,
                session.client_name,
                session.play_method.map(|method| method.as_str()),
                session.video_method,
                session.audio_method,
                session.video_codec_from,
                session.video_codec_to,
                session.audio_codec_from,
                session.audio_codec_to,
                reasons,
                session.started_at,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Closes a session. An `ended_at` before `started_at` is clamped to `started_at`.
    ///
    /// Returns false when the session is unknown.
    pub fn close_session(
        &mut self,
        session_id: &SessionId,
        item_id: &ItemId,
        ended_at: i64,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "
            UPDATE play_sessions
            SET ended_at = MAX(?, started_at), is_active = 0
            WHERE session_id = ? AND item_id = ?
            ",
            params![ended_at, session_id.as_str(), item_id.as_str()],
        )?;
        Ok(updated > 0)
    }

    /// Stores an interval exactly as observed. Returns the interval row id.
    ///
    /// Intervals naming a session must reference one recorded with
    /// [`Database::upsert_session`] for the same item.
    pub fn insert_interval(&mut self, interval: &IntervalRecord) -> Result<i64, DbError> {
        let session_fk = match &interval.session_id {
            Some(session_id) => Some(self.session_row_id(session_id, &interval.item_id)?.ok_or_else(
                || DbError::UnknownSession {
                    session_id: session_id.to_string(),
                    item_id: interval.item_id.to_string(),
                },
            )?),
            None => None,
        };
        let duration = interval
            .duration_seconds
            .unwrap_or_else(|| Seconds::new(interval.end_ts.saturating_sub(interval.start_ts).max(0)));

        self.conn.execute(
            "
            INSERT INTO play_intervals
            (session_fk, item_id, user_id, start_ts, end_ts, start_pos_ticks, end_pos_ticks,
             duration_seconds, seeked)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                session_fk,
                interval.item_id.as_str(),
                interval.user_id.as_str(),
                interval.start_ts,
                interval.end_ts,
                interval.start_pos_ticks.get(),
                interval.end_pos_ticks.get(),
                duration.get(),
                interval.seeked,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Records or replaces library metadata for an item.
    pub fn upsert_item(&mut self, item: &ItemRecord) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO library_item
            (id, name, media_type, series_id, series_name, run_time_ticks, server_id, server_type)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                media_type = excluded.media_type,
                series_id = excluded.series_id,
                series_name = excluded.series_name,
                run_time_ticks = excluded.run_time_ticks,
                server_id = excluded.server_id,
                server_type = excluded.server_type
            ",
            params![
                item.id.as_str(),
                item.name,
                item.media_type,
                item.series_id,
                item.series_name,
                item.run_time_ticks.map(Ticks::get),
                item.server_id,
                item.server_type,
            ],
        )?;
        Ok(())
    }

    /// Row counts across every table.
    pub fn stats(&self) -> Result<StoreStats, DbError> {
        let (active_sessions, closed_sessions) = self.conn.query_row(
            "
            SELECT COALESCE(SUM(is_active = 1), 0), COALESCE(SUM(is_active = 0), 0)
            FROM play_sessions
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (intervals, malformed_intervals, detached_intervals) = self.conn.query_row(
            "
            SELECT COUNT(*),
                   COALESCE(SUM(end_ts <= start_ts OR end_pos_ticks < start_pos_ticks), 0),
                   COALESCE(SUM(session_fk IS NULL), 0)
            FROM play_intervals
            ",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let items = self
            .conn
            .query_row("SELECT COUNT(*) FROM library_item", [], |row| row.get(0))?;
        let (maintenance_runs, last_maintenance_at) = self.conn.query_row(
            "SELECT COUNT(*), MAX(started_at) FROM maintenance_jobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreStats {
            active_sessions,
            closed_sessions,
            intervals,
            malformed_intervals,
            detached_intervals,
            items,
            maintenance_runs,
            last_maintenance_at,
        })
    }

    fn session_row_id(
        &self,
        session_id: &SessionId,
        item_id: &ItemId,
    ) -> Result<Option<i64>, DbError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM play_sessions WHERE session_id = ? AND item_id = ?",
                params![session_id.as_str(), item_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn count_to_i64(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}
