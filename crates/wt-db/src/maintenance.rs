//! Corrective maintenance jobs.
//!
//! Each job repairs one known class of historical capture defect in
//! `play_intervals`. Jobs run inside a single transaction, never look across
//! sessions, and are idempotent: a second run over repaired data changes
//! nothing. A dry run does all the work and rolls it back.

use std::fmt;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wt_core::units::{TICKS_PER_MILLISECOND, TICKS_PER_SECOND};
use wt_core::{Seconds, Ticks};

use crate::{Database, DbError};

/// Whether a job's changes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Examine and report, then roll back.
    DryRun,
    /// Commit the changes.
    Apply,
}

impl JobMode {
    #[must_use]
    pub const fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { Self::DryRun } else { Self::Apply }
    }

    #[must_use]
    pub const fn is_dry_run(self) -> bool {
        matches!(self, Self::DryRun)
    }
}

/// The available maintenance jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaintenanceOp {
    #[serde(rename = "fix_units")]
    NormalizeUnits,
    #[serde(rename = "dedupe")]
    Dedupe,
    #[serde(rename = "supersets")]
    RemoveSupersets,
    #[serde(rename = "fix_fallback")]
    FixFallback,
    #[serde(rename = "backfill_started")]
    BackfillStarted,
}

impl MaintenanceOp {
    /// Every job, in the order a full pass runs them.
    pub const ALL: [Self; 5] = [
        Self::NormalizeUnits,
        Self::Dedupe,
        Self::RemoveSupersets,
        Self::FixFallback,
        Self::BackfillStarted,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NormalizeUnits => "fix_units",
            Self::Dedupe => "dedupe",
            Self::RemoveSupersets => "supersets",
            Self::FixFallback => "fix_fallback",
            Self::BackfillStarted => "backfill_started",
        }
    }
}

impl fmt::Display for MaintenanceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MaintenanceOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown maintenance operation {s}"))
    }
}

/// Tuning for the corrective jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// How far a stored duration may exceed the position-implied duration
    /// before the row counts as a fallback interval. Default: 120.
    pub fallback_slack_seconds: i64,
    /// Durations above this many seconds (and positions above it in ticks)
    /// are checked for unit confusion. Default: 86400.
    pub unit_threshold_seconds: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            fallback_slack_seconds: 120,
            unit_threshold_seconds: 86_400,
        }
    }
}

impl MaintenanceConfig {
    pub fn validate(&self) -> Result<(), DbError> {
        if self.fallback_slack_seconds < 0 {
            return Err(DbError::InvalidParameter {
                name: "slack_seconds",
                value: self.fallback_slack_seconds,
            });
        }
        if self.unit_threshold_seconds <= 0 {
            return Err(DbError::InvalidParameter {
                name: "threshold_seconds",
                value: self.unit_threshold_seconds,
            });
        }
        Ok(())
    }
}

/// Outcome of one maintenance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub candidates_examined: usize,
    pub rows_changed: usize,
    /// Seconds removed from (or moved within) the affected rows.
    pub seconds_adjusted: i64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct JobCounts {
    candidates_examined: usize,
    rows_changed: usize,
    seconds_adjusted: i64,
}

impl JobCounts {
    const fn into_report(self, mode: JobMode) -> JobReport {
        JobReport {
            candidates_examined: self.candidates_examined,
            rows_changed: self.rows_changed,
            seconds_adjusted: self.seconds_adjusted,
            dry_run: mode.is_dry_run(),
        }
    }
}

impl Database {
    /// Runs one job with its configured parameters.
    pub fn run_maintenance(
        &mut self,
        op: MaintenanceOp,
        mode: JobMode,
        config: &MaintenanceConfig,
    ) -> Result<JobReport, DbError> {
        config.validate()?;
        self.run_job(op, mode, job_parameters(op, config), |conn| {
            job_body(conn, op, config)
        })
    }

    /// Runs every job in [`MaintenanceOp::ALL`] order.
    ///
    /// Applying gives each job its own transaction and stops at the first
    /// failure; earlier jobs stay applied. A dry run chains every job inside
    /// one transaction that is rolled back at the end, so each report sees
    /// what the jobs before it would have changed.
    pub fn run_all_maintenance(
        &mut self,
        mode: JobMode,
        config: &MaintenanceConfig,
    ) -> Result<Vec<(MaintenanceOp, JobReport)>, DbError> {
        config.validate()?;
        if mode.is_dry_run() {
            return self.dry_run_all(config);
        }
        let mut reports = Vec::with_capacity(MaintenanceOp::ALL.len());
        for op in MaintenanceOp::ALL {
            reports.push((op, self.run_maintenance(op, mode, config)?));
        }
        Ok(reports)
    }

    fn dry_run_all(
        &mut self,
        config: &MaintenanceConfig,
    ) -> Result<Vec<(MaintenanceOp, JobReport)>, DbError> {
        let mut outcomes = Vec::with_capacity(MaintenanceOp::ALL.len());
        {
            let tx = self.conn.transaction()?;
            for op in MaintenanceOp::ALL {
                let outcome = job_body(&*tx, op, config);
                let failed = outcome.is_err();
                outcomes.push((op, outcome));
                if failed {
                    break;
                }
            }
            tx.rollback()?;
        }

        // Audit rows go in after the rollback so they survive it.
        let mut reports = Vec::with_capacity(outcomes.len());
        for (op, outcome) in outcomes {
            let parameters = job_parameters(op, config);
            let job_id = self.begin_job(op, JobMode::DryRun, &parameters)?;
            let report = self.finish_job(op, &job_id, JobMode::DryRun, &parameters, outcome)?;
            reports.push((op, report));
        }
        Ok(reports)
    }

    /// Keeps only the newest row of each `(session, start_ts)` group.
    pub fn remove_duplicate_intervals(&mut self, mode: JobMode) -> Result<JobReport, DbError> {
        self.run_job(MaintenanceOp::Dedupe, mode, json!({}), remove_duplicates)
    }

    /// Deletes intervals that contain another well-formed interval of their session.
    pub fn remove_superset_intervals(&mut self, mode: JobMode) -> Result<JobReport, DbError> {
        self.run_job(MaintenanceOp::RemoveSupersets, mode, json!({}), remove_supersets)
    }

    /// Shrinks legacy fallback intervals to the duration their positions support.
    pub fn fix_fallback_intervals(
        &mut self,
        mode: JobMode,
        slack: Seconds,
    ) -> Result<JobReport, DbError> {
        if slack.get() < 0 {
            return Err(DbError::InvalidParameter {
                name: "slack_seconds",
                value: slack.get(),
            });
        }
        self.run_job(
            MaintenanceOp::FixFallback,
            mode,
            json!({ "slack_seconds": slack.get() }),
            |conn| fix_fallback(conn, slack),
        )
    }

    /// Rescales durations stored in ticks and positions carrying a spurious
    /// millisecond factor.
    pub fn normalize_units(&mut self, mode: JobMode, threshold: Seconds) -> Result<JobReport, DbError> {
        if !threshold.is_positive() {
            return Err(DbError::InvalidParameter {
                name: "threshold_seconds",
                value: threshold.get(),
            });
        }
        self.run_job(
            MaintenanceOp::NormalizeUnits,
            mode,
            json!({ "threshold_seconds": threshold.get() }),
            |conn| normalize_units(conn, threshold),
        )
    }

    /// Moves each session's `started_at` back to its earliest interval.
    pub fn backfill_session_starts(&mut self, mode: JobMode) -> Result<JobReport, DbError> {
        self.run_job(
            MaintenanceOp::BackfillStarted,
            mode,
            json!({}),
            backfill_started,
        )
    }

    fn run_job<F>(
        &mut self,
        op: MaintenanceOp,
        mode: JobMode,
        parameters: Value,
        body: F,
    ) -> Result<JobReport, DbError>
    where
        F: FnOnce(&Connection) -> Result<JobCounts, DbError>,
    {
        let job_id = self.begin_job(op, mode, &parameters)?;
        let outcome = execute_job(&mut self.conn, mode, body);
        self.finish_job(op, &job_id, mode, &parameters, outcome)
    }

    /// Records how a run ended in the audit log.
    fn finish_job(
        &self,
        op: MaintenanceOp,
        job_id: &str,
        mode: JobMode,
        parameters: &Value,
        outcome: Result<JobCounts, DbError>,
    ) -> Result<JobReport, DbError> {
        match outcome {
            Ok(counts) => {
                let report = counts.into_report(mode);
                self.complete_job(job_id, &report)?;
                tracing::info!(
                    job = %op,
                    id = %job_id,
                    candidates = report.candidates_examined,
                    changed = report.rows_changed,
                    seconds = report.seconds_adjusted,
                    dry_run = report.dry_run,
                    "maintenance job completed"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(job = %op, id = %job_id, error = %err, "maintenance job failed");
                self.fail_job(job_id, parameters, &err)?;
                Err(err)
            }
        }
    }
}

fn job_parameters(op: MaintenanceOp, config: &MaintenanceConfig) -> Value {
    match op {
        MaintenanceOp::NormalizeUnits => {
            json!({ "threshold_seconds": config.unit_threshold_seconds })
        }
        MaintenanceOp::FixFallback => json!({ "slack_seconds": config.fallback_slack_seconds }),
        MaintenanceOp::Dedupe | MaintenanceOp::RemoveSupersets | MaintenanceOp::BackfillStarted => {
            json!({})
        }
    }
}

fn job_body(
    conn: &Connection,
    op: MaintenanceOp,
    config: &MaintenanceConfig,
) -> Result<JobCounts, DbError> {
    match op {
        MaintenanceOp::NormalizeUnits => {
            normalize_units(conn, Seconds::new(config.unit_threshold_seconds))
        }
        MaintenanceOp::Dedupe => remove_duplicates(conn),
        MaintenanceOp::RemoveSupersets => remove_supersets(conn),
        MaintenanceOp::FixFallback => fix_fallback(conn, Seconds::new(config.fallback_slack_seconds)),
        MaintenanceOp::BackfillStarted => backfill_started(conn),
    }
}

/// Runs `body` in a transaction that is committed only in apply mode.
/// An error drops the transaction, which rolls it back.
fn execute_job<F>(conn: &mut Connection, mode: JobMode, body: F) -> Result<JobCounts, DbError>
where
    F: FnOnce(&Connection) -> Result<JobCounts, DbError>,
{
    let tx = conn.transaction()?;
    let counts = body(&*tx)?;
    if mode.is_dry_run() {
        tx.rollback()?;
    } else {
        tx.commit()?;
    }
    Ok(counts)
}

fn to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// Collects `(id, seconds)` pairs from a query selecting exactly those columns.
fn select_rows(conn: &Connection, sql: &str) -> Result<Vec<(i64, i64)>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut selected = Vec::new();
    for row in rows {
        selected.push(row?);
    }
    Ok(selected)
}

/// Deletes the given intervals, returning rows deleted and their total length.
fn delete_intervals(conn: &Connection, doomed: &[(i64, i64)]) -> Result<(usize, i64), DbError> {
    let mut stmt = conn.prepare("DELETE FROM play_intervals WHERE id = ?")?;
    let mut deleted = 0;
    let mut seconds = 0_i64;
    for &(id, length) in doomed {
        deleted += stmt.execute([id])?;
        seconds = seconds.saturating_add(length);
    }
    Ok((deleted, seconds))
}

fn remove_duplicates(conn: &Connection) -> Result<JobCounts, DbError> {
    let in_groups: i64 = conn.query_row(
        "
        SELECT COALESCE(SUM(n), 0) FROM (
            SELECT COUNT(*) AS n
            FROM play_intervals
            WHERE session_fk IS NOT NULL
            GROUP BY session_fk, start_ts
            HAVING COUNT(*) > 1
        )
        ",
        [],
        |row| row.get(0),
    )?;
    let doomed = select_rows(
        conn,
        "
        SELECT id, MAX(end_ts - start_ts, 0)
        FROM play_intervals
        WHERE session_fk IS NOT NULL
          AND id NOT IN (
              SELECT MAX(id) FROM play_intervals
              WHERE session_fk IS NOT NULL
              GROUP BY session_fk, start_ts
          )
        ORDER BY id
        ",
    )?;
    let (deleted, seconds) = delete_intervals(conn, &doomed)?;
    tracing::debug!(groups_rows = in_groups, deleted, "removed duplicate intervals");
    Ok(JobCounts {
        candidates_examined: to_count(in_groups),
        rows_changed: deleted,
        seconds_adjusted: seconds,
    })
}

fn remove_supersets(conn: &Connection) -> Result<JobCounts, DbError> {
    // An exact copy only dooms the lower id, so one of them always survives.
    let doomed = select_rows(
        conn,
        "
        SELECT pi.id, MAX(pi.end_ts - pi.start_ts, 0)
        FROM play_intervals pi
        WHERE pi.session_fk IS NOT NULL
          AND EXISTS (
              SELECT 1 FROM play_intervals o
              WHERE o.session_fk = pi.session_fk
                AND o.id <> pi.id
                AND o.end_ts > o.start_ts
                AND o.end_pos_ticks >= o.start_pos_ticks
                AND pi.start_ts <= o.start_ts
                AND pi.end_ts >= o.end_ts
                AND NOT (pi.start_ts = o.start_ts AND pi.end_ts = o.end_ts AND pi.id > o.id)
          )
        ORDER BY pi.id
        ",
    )?;
    let (deleted, seconds) = delete_intervals(conn, &doomed)?;
    tracing::debug!(deleted, "removed superset intervals");
    Ok(JobCounts {
        candidates_examined: doomed.len(),
        rows_changed: deleted,
        seconds_adjusted: seconds,
    })
}

/// The latest state of a fallback candidate and its context.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FallbackRow {
    start_ts: i64,
    end_ts: i64,
    start_pos: Ticks,
    end_pos: Ticks,
    duration: Seconds,
    session_started_at: i64,
    runtime: Option<Ticks>,
    /// Stored duration of the session's other intervals.
    other_seconds: Seconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FallbackFix {
    start_ts: i64,
    duration: Seconds,
    seconds_removed: i64,
}

fn read_fallback_row(conn: &Connection, id: i64) -> Result<Option<FallbackRow>, DbError> {
    let row = conn
        .query_row(
            "
            SELECT pi.start_ts, pi.end_ts, pi.start_pos_ticks, pi.end_pos_ticks,
                   pi.duration_seconds, ps.started_at, li.run_time_ticks,
                   (SELECT COALESCE(SUM(o.duration_seconds), 0)
                    FROM play_intervals o
                    WHERE o.session_fk = pi.session_fk AND o.id <> pi.id)
            FROM play_intervals pi
            JOIN play_sessions ps ON ps.id = pi.session_fk
            LEFT JOIN library_item li ON li.id = pi.item_id
            WHERE pi.id = ?
            ",
            [id],
            |row| {
                Ok(FallbackRow {
                    start_ts: row.get(0)?,
                    end_ts: row.get(1)?,
                    start_pos: Ticks::new(row.get(2)?),
                    end_pos: Ticks::new(row.get(3)?),
                    duration: Seconds::new(row.get(4)?),
                    session_started_at: row.get(5)?,
                    runtime: row.get::<_, Option<i64>>(6)?.map(Ticks::new),
                    other_seconds: Seconds::new(row.get(7)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Decides how to shrink a fallback interval, or `None` to leave it alone.
fn plan_fallback_fix(row: &FallbackRow, slack: Seconds) -> Option<FallbackFix> {
    if row.end_pos <= row.start_pos {
        return None;
    }
    let implied = (row.end_pos - row.start_pos).to_seconds();
    if row.duration <= implied + slack {
        return None;
    }

    let mut corrected = implied;
    if let Some(runtime) = row.runtime.filter(|runtime| runtime.is_positive()) {
        corrected = corrected.min(runtime.to_seconds() - row.other_seconds);
    }
    if !corrected.is_positive() {
        return None;
    }

    let start_ts = row
        .end_ts
        .saturating_sub(corrected.get())
        .max(row.session_started_at);
    if start_ts >= row.end_ts {
        return None;
    }
    let duration = Seconds::new(row.end_ts - start_ts);
    Some(FallbackFix {
        start_ts,
        duration,
        seconds_removed: (row.duration - duration).get(),
    })
}

fn fix_fallback(conn: &Connection, slack: Seconds) -> Result<JobCounts, DbError> {
    let candidates = {
        let mut stmt = conn.prepare(
            "
            SELECT id FROM play_intervals
            WHERE session_fk IS NOT NULL
              AND end_pos_ticks > start_pos_ticks
              AND duration_seconds > (end_pos_ticks - start_pos_ticks) / ? + ?
            ORDER BY id
            ",
        )?;
        let rows = stmt.query_map(params![TICKS_PER_SECOND, slack.get()], |row| {
            row.get::<_, i64>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        ids
    };

    let mut counts = JobCounts::default();
    let mut update = conn.prepare(
        "UPDATE play_intervals SET start_ts = ?, duration_seconds = ? WHERE id = ?",
    )?;
    for id in candidates {
        counts.candidates_examined += 1;
        // Earlier updates in this batch change the session totals a cap reads.
        let Some(row) = read_fallback_row(conn, id)? else {
            continue;
        };
        let Some(fix) = plan_fallback_fix(&row, slack) else {
            tracing::debug!(id, "fallback candidate skipped");
            continue;
        };
        counts.rows_changed += update.execute(params![fix.start_ts, fix.duration.get(), id])?;
        counts.seconds_adjusted = counts.seconds_adjusted.saturating_add(fix.seconds_removed);
    }
    Ok(counts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnitRow {
    duration: Seconds,
    start_pos: Ticks,
    end_pos: Ticks,
}

/// Divides `value` by `factor` when it is above `limit` and the result is not.
fn rescale(value: i64, limit: i64, factor: i64) -> Option<i64> {
    (value > limit && value / factor <= limit).then_some(value / factor)
}

/// Rescales a row's positions together: when either is above `limit` and both
/// quotients are within it. Scaling one alone would invert the range.
fn rescale_positions(start: Ticks, end: Ticks, limit: Ticks) -> Option<(Ticks, Ticks)> {
    if start <= limit && end <= limit {
        return None;
    }
    let start = Ticks::new(start.get() / TICKS_PER_MILLISECOND);
    let end = Ticks::new(end.get() / TICKS_PER_MILLISECOND);
    (start <= limit && end <= limit).then_some((start, end))
}

/// The corrected row, or `None` when no fixed factor explains the values.
fn plan_unit_fix(row: UnitRow, threshold: Seconds, threshold_ticks: Ticks) -> Option<UnitRow> {
    let duration = rescale(row.duration.get(), threshold.get(), TICKS_PER_SECOND).map(Seconds::new);
    let positions = rescale_positions(row.start_pos, row.end_pos, threshold_ticks);

    if duration.is_none() && positions.is_none() {
        return None;
    }
    let (start_pos, end_pos) = positions.unwrap_or((row.start_pos, row.end_pos));
    Some(UnitRow {
        duration: duration.unwrap_or(row.duration),
        start_pos,
        end_pos,
    })
}

fn normalize_units(conn: &Connection, threshold: Seconds) -> Result<JobCounts, DbError> {
    let threshold_ticks = threshold.to_ticks()?;
    let rows = {
        let mut stmt = conn.prepare(
            "
            SELECT id, duration_seconds, start_pos_ticks, end_pos_ticks
            FROM play_intervals
            WHERE duration_seconds > ?1 OR start_pos_ticks > ?2 OR end_pos_ticks > ?2
            ORDER BY id
            ",
        )?;
        let rows = stmt.query_map(params![threshold.get(), threshold_ticks.get()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                UnitRow {
                    duration: Seconds::new(row.get(1)?),
                    start_pos: Ticks::new(row.get(2)?),
                    end_pos: Ticks::new(row.get(3)?),
                },
            ))
        })?;
        let mut selected = Vec::new();
        for row in rows {
            selected.push(row?);
        }
        selected
    };

    let mut counts = JobCounts::default();
    let mut update = conn.prepare(
        "
        UPDATE play_intervals
        SET duration_seconds = ?, start_pos_ticks = ?, end_pos_ticks = ?
        WHERE id = ?
        ",
    )?;
    for (id, row) in rows {
        counts.candidates_examined += 1;
        let Some(fixed) = plan_unit_fix(row, threshold, threshold_ticks) else {
            tracing::debug!(id, "unit candidate left unchanged");
            continue;
        };
        counts.rows_changed += update.execute(params![
            fixed.duration.get(),
            fixed.start_pos.get(),
            fixed.end_pos.get(),
            id,
        ])?;
        counts.seconds_adjusted = counts
            .seconds_adjusted
            .saturating_add((row.duration - fixed.duration).get());
    }
    Ok(counts)
}

fn backfill_started(conn: &Connection) -> Result<JobCounts, DbError> {
    let sessions = {
        let mut stmt = conn.prepare(
            "
            SELECT ps.id, ps.started_at, MIN(pi.start_ts)
            FROM play_sessions ps
            JOIN play_intervals pi ON pi.session_fk = ps.id
            WHERE pi.end_ts > pi.start_ts AND pi.end_pos_ticks >= pi.start_pos_ticks
            GROUP BY ps.id
            HAVING MIN(pi.start_ts) < ps.started_at
            ORDER BY ps.id
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut selected = Vec::new();
        for row in rows {
            selected.push(row?);
        }
        selected
    };

    let mut counts = JobCounts::default();
    let mut update = conn.prepare("UPDATE play_sessions SET started_at = ? WHERE id = ?")?;
    for (id, started_at, earliest) in sessions {
        counts.candidates_examined += 1;
        counts.rows_changed += update.execute(params![earliest, id])?;
        counts.seconds_adjusted = counts
            .seconds_adjusted
            .saturating_add(started_at - earliest);
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{IntervalRecord, JobStatus};

    fn record(
        session_id: Option<&str>,
        item_id: &str,
        (start, end): (i64, i64),
        (start_pos_secs, end_pos_secs): (i64, i64),
        duration: i64,
    ) -> IntervalRecord {
        IntervalRecord {
            start_pos_ticks: Seconds::new(start_pos_secs).to_ticks().unwrap(),
            end_pos_ticks: Seconds::new(end_pos_secs).to_ticks().unwrap(),
            duration_seconds: Some(Seconds::new(duration)),
            ..interval(session_id, item_id, start, end)
        }
    }

    fn interval_row(db: &Database, id: i64) -> (i64, i64, i64) {
        db.conn
            .query_row(
                "SELECT start_ts, end_ts, duration_seconds FROM play_intervals WHERE id = ?",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap()
    }

    #[test]
    fn dedupe_keeps_newest_row_per_session_start() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 10), (0, 12), (0, 11), (20, 30)]);

        let report = db.remove_duplicate_intervals(JobMode::Apply).unwrap();
        assert_eq!(report.candidates_examined, 3);
        assert_eq!(report.rows_changed, 2);
        assert_eq!(report.seconds_adjusted, 22);
        assert_eq!(interval_spans(&db), vec![(0, 11), (20, 30)]);

        let again = db.remove_duplicate_intervals(JobMode::Apply).unwrap();
        assert_eq!(again.rows_changed, 0);
    }

    #[test]
    fn dedupe_never_crosses_sessions_or_touches_detached_rows() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 10)]);
        seed_session(&mut db, "s2", "movie", &[(0, 10)]);
        db.insert_interval(&interval(None, "movie", 0, 10)).unwrap();
        db.insert_interval(&interval(None, "movie", 0, 10)).unwrap();

        let report = db.remove_duplicate_intervals(JobMode::Apply).unwrap();
        assert_eq!(report.rows_changed, 0);
        assert_eq!(interval_spans(&db).len(), 4);
    }

    #[test]
    fn superset_removal_keeps_the_contained_interval() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 3_600), (100, 400)]);

        let report = db.remove_superset_intervals(JobMode::Apply).unwrap();
        assert_eq!(report.rows_changed, 1);
        assert_eq!(report.seconds_adjusted, 3_600);
        assert_eq!(interval_spans(&db), vec![(100, 400)]);

        let again = db.remove_superset_intervals(JobMode::Apply).unwrap();
        assert_eq!(again.rows_changed, 0);
    }

    #[test]
    fn superset_removal_keeps_one_of_identical_rows() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 60), (0, 60), (0, 60)]);

        let report = db.remove_superset_intervals(JobMode::Apply).unwrap();
        assert_eq!(report.rows_changed, 2);
        assert_eq!(interval_spans(&db), vec![(0, 60)]);
    }

    #[test]
    fn superset_removal_ignores_malformed_rows_and_other_sessions() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 100), (50, 40)]);
        seed_session(&mut db, "s2", "movie", &[(10, 20)]);

        let report = db.remove_superset_intervals(JobMode::Apply).unwrap();
        assert_eq!(report.rows_changed, 0);
        assert_eq!(interval_spans(&db).len(), 3);
    }

    #[test]
    fn fallback_interval_shrinks_to_position_duration() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        db.upsert_item(&item("movie", Some(3_600))).unwrap();
        let id = db
            .insert_interval(&record(Some("s1"), "movie", (0, 7_200), (0, 1_800), 7_200))
            .unwrap();

        let report = db
            .fix_fallback_intervals(JobMode::Apply, Seconds::new(120))
            .unwrap();
        assert_eq!(report.candidates_examined, 1);
        assert_eq!(report.rows_changed, 1);
        assert_eq!(report.seconds_adjusted, 5_400);
        assert_eq!(interval_row(&db, id), (5_400, 7_200, 1_800));

        let again = db
            .fix_fallback_intervals(JobMode::Apply, Seconds::new(120))
            .unwrap();
        assert_eq!(again.candidates_examined, 0);
        assert_eq!(again.rows_changed, 0);
    }

    #[test]
    fn fallback_start_never_precedes_session_start() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 1_000)).unwrap();
        let id = db
            .insert_interval(&record(Some("s1"), "movie", (1_000, 1_500), (0, 1_000), 5_000))
            .unwrap();

        let report = db
            .fix_fallback_intervals(JobMode::Apply, Seconds::new(120))
            .unwrap();
        assert_eq!(report.rows_changed, 1);
        assert_eq!(report.seconds_adjusted, 4_500);
        assert_eq!(interval_row(&db, id), (1_000, 1_500, 500));
    }

    #[test]
    fn fallback_correction_is_capped_by_remaining_runtime() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        db.upsert_item(&item("movie", Some(3_600))).unwrap();
        db.insert_interval(&record(Some("s1"), "movie", (0, 3_000), (0, 3_000), 3_000))
            .unwrap();
        let id = db
            .insert_interval(&record(
                Some("s1"),
                "movie",
                (3_000, 10_000),
                (3_000, 4_800),
                7_000,
            ))
            .unwrap();

        db.fix_fallback_intervals(JobMode::Apply, Seconds::new(120))
            .unwrap();
        assert_eq!(interval_row(&db, id), (9_400, 10_000, 600));
    }

    #[test]
    fn fallback_skips_rows_with_no_runtime_left() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        db.upsert_item(&item("movie", Some(1_000))).unwrap();
        db.insert_interval(&record(Some("s1"), "movie", (0, 1_000), (0, 1_000), 1_000))
            .unwrap();
        let id = db
            .insert_interval(&record(Some("s1"), "movie", (1_000, 9_000), (0, 600), 8_000))
            .unwrap();

        let report = db
            .fix_fallback_intervals(JobMode::Apply, Seconds::new(120))
            .unwrap();
        assert_eq!(report.candidates_examined, 1);
        assert_eq!(report.rows_changed, 0);
        assert_eq!(interval_row(&db, id), (1_000, 9_000, 8_000));
    }

    #[test]
    fn fallback_within_slack_is_not_a_candidate() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        db.insert_interval(&record(Some("s1"), "movie", (0, 700), (0, 600), 700))
            .unwrap();
        let report = db
            .fix_fallback_intervals(JobMode::Apply, Seconds::new(120))
            .unwrap();
        assert_eq!(report.candidates_examined, 0);
    }

    #[test]
    fn dry_run_reports_but_changes_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        let id = db
            .insert_interval(&record(Some("s1"), "movie", (0, 7_200), (0, 1_800), 7_200))
            .unwrap();
        seed_session(&mut db, "s2", "movie", &[(0, 3_600), (100, 400), (100, 300)]);

        let report = db
            .fix_fallback_intervals(JobMode::DryRun, Seconds::new(120))
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.rows_changed, 1);
        assert_eq!(interval_row(&db, id), (0, 7_200, 7_200));

        let before = interval_spans(&db);
        let report = db.remove_superset_intervals(JobMode::DryRun).unwrap();
        assert_eq!(report.rows_changed, 2);
        assert_eq!(interval_spans(&db), before);

        let jobs = db.list_jobs(10).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.dry_run && job.status == JobStatus::Completed));
    }

    #[test]
    fn unit_normalization_rescales_explainable_values() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        let in_ticks = db
            .insert_interval(&IntervalRecord {
                duration_seconds: Some(Seconds::new(600 * TICKS_PER_SECOND)),
                ..interval(Some("s1"), "movie", 0, 600)
            })
            .unwrap();
        let scaled_positions = db
            .insert_interval(&IntervalRecord {
                start_pos_ticks: Ticks::new(600 * TICKS_PER_SECOND * 10_000),
                end_pos_ticks: Ticks::new(1_200 * TICKS_PER_SECOND * 10_000),
                ..interval(Some("s1"), "movie", 600, 1_200)
            })
            .unwrap();
        let unexplained = db
            .insert_interval(&IntervalRecord {
                duration_seconds: Some(Seconds::new(i64::MAX / 2)),
                ..interval(Some("s1"), "movie", 1_200, 1_800)
            })
            .unwrap();

        let report = db
            .normalize_units(JobMode::Apply, Seconds::new(86_400))
            .unwrap();
        assert_eq!(report.candidates_examined, 3);
        assert_eq!(report.rows_changed, 2);
        assert_eq!(report.seconds_adjusted, 600 * TICKS_PER_SECOND - 600);

        assert_eq!(interval_row(&db, in_ticks).2, 600);
        let positions: (i64, i64) = db
            .conn
            .query_row(
                "SELECT start_pos_ticks, end_pos_ticks FROM play_intervals WHERE id = ?",
                [scaled_positions],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(positions, (600 * TICKS_PER_SECOND, 1_200 * TICKS_PER_SECOND));
        assert_eq!(interval_row(&db, unexplained).2, i64::MAX / 2);

        let again = db
            .normalize_units(JobMode::Apply, Seconds::new(86_400))
            .unwrap();
        assert_eq!(again.candidates_examined, 1);
        assert_eq!(again.rows_changed, 0);
    }

    fn positions(db: &Database, id: i64) -> (i64, i64) {
        db.conn
            .query_row(
                "SELECT start_pos_ticks, end_pos_ticks FROM play_intervals WHERE id = ?",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap()
    }

    #[test]
    fn unit_normalization_rescales_both_positions_together() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        let id = db
            .insert_interval(&IntervalRecord {
                start_pos_ticks: Ticks::new(5 * TICKS_PER_SECOND * 10_000),
                end_pos_ticks: Ticks::new(3_600 * TICKS_PER_SECOND * 10_000),
                ..interval(Some("s1"), "movie", 0, 3_595)
            })
            .unwrap();

        let report = db
            .normalize_units(JobMode::Apply, Seconds::new(86_400))
            .unwrap();
        assert_eq!(report.rows_changed, 1);
        assert_eq!(
            positions(&db, id),
            (5 * TICKS_PER_SECOND, 3_600 * TICKS_PER_SECOND)
        );
        assert_eq!(db.stats().unwrap().malformed_intervals, 0);

        let again = db
            .normalize_units(JobMode::Apply, Seconds::new(86_400))
            .unwrap();
        assert_eq!(again.candidates_examined, 0);
    }

    #[test]
    fn unit_normalization_leaves_positions_it_cannot_explain() {
        let mut db = Database::open_in_memory().unwrap();
        db.upsert_session(&session("s1", "movie", 0)).unwrap();
        let start = 10 * TICKS_PER_SECOND;
        let end = i64::MAX / 2;
        let id = db
            .insert_interval(&IntervalRecord {
                start_pos_ticks: Ticks::new(start),
                end_pos_ticks: Ticks::new(end),
                ..interval(Some("s1"), "movie", 0, 600)
            })
            .unwrap();

        let report = db
            .normalize_units(JobMode::Apply, Seconds::new(86_400))
            .unwrap();
        assert_eq!(report.candidates_examined, 1);
        assert_eq!(report.rows_changed, 0);
        assert_eq!(positions(&db, id), (start, end));
    }

    #[test]
    fn superset_of_a_row_with_backwards_positions_is_kept() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 3_600)]);
        db.insert_interval(&IntervalRecord {
            start_pos_ticks: Ticks::new(600),
            end_pos_ticks: Ticks::new(100),
            ..interval(Some("s1"), "movie", 100, 400)
        })
        .unwrap();

        let report = db.remove_superset_intervals(JobMode::Apply).unwrap();
        assert_eq!(report.rows_changed, 0);
        assert_eq!(interval_spans(&db).len(), 2);
    }

    #[test]
    fn full_dry_run_chains_jobs_and_matches_the_apply_pass() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 3_600), (100, 400), (100, 400)]);
        let before = interval_spans(&db);

        let dry = db
            .run_all_maintenance(JobMode::DryRun, &MaintenanceConfig::default())
            .unwrap();
        assert_eq!(interval_spans(&db), before);
        assert!(dry.iter().all(|(_, report)| report.dry_run));

        let dedupe = dry[1].1;
        let supersets = dry[2].1;
        assert_eq!(dedupe.rows_changed, 1);
        assert_eq!(supersets.rows_changed, 1);
        assert_eq!(supersets.seconds_adjusted, 3_600);

        let applied = db
            .run_all_maintenance(JobMode::Apply, &MaintenanceConfig::default())
            .unwrap();
        let counts = |reports: &[(MaintenanceOp, JobReport)]| -> Vec<(MaintenanceOp, usize, usize, i64)> {
            reports
                .iter()
                .map(|(op, r)| (*op, r.candidates_examined, r.rows_changed, r.seconds_adjusted))
                .collect()
        };
        assert_eq!(counts(&dry), counts(&applied));

        let jobs = db.list_jobs(100).unwrap();
        assert_eq!(jobs.len(), 10);
        assert_eq!(jobs.iter().filter(|job| job.dry_run).count(), 5);
        assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));
    }

    #[test]
    fn backfill_moves_session_start_to_earliest_interval() {
        let mut db = Database::open_in_memory().unwrap();
        let id = db.upsert_session(&session("s1", "movie", 500)).unwrap();
        db.insert_interval(&interval(Some("s1"), "movie", 100, 200))
            .unwrap();
        db.insert_interval(&interval(Some("s1"), "movie", 90, 80))
            .unwrap();
        seed_session(&mut db, "s2", "movie", &[(1_000, 1_100)]);

        let report = db.backfill_session_starts(JobMode::Apply).unwrap();
        assert_eq!(report.rows_changed, 1);
        assert_eq!(report.seconds_adjusted, 400);
        let started_at: i64 = db
            .conn
            .query_row(
                "SELECT started_at FROM play_sessions WHERE id = ?",
                [id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(started_at, 100);

        let again = db.backfill_session_starts(JobMode::Apply).unwrap();
        assert_eq!(again.rows_changed, 0);
    }

    #[test]
    fn failed_job_rolls_back_and_is_audited() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 10), (10, 20)]);

        let result = db.run_job(MaintenanceOp::Dedupe, JobMode::Apply, json!({}), |conn| {
            conn.execute("DELETE FROM play_intervals", [])?;
            Err(DbError::InvalidParameter {
                name: "injected",
                value: 1,
            })
        });
        assert!(result.is_err());
        assert_eq!(interval_spans(&db).len(), 2);

        let jobs = db.list_jobs(1).unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(
            jobs[0].summary.as_ref().and_then(|s| s.get("error")),
            Some(&Value::String("invalid injected: 1".to_string()))
        );
    }

    #[test]
    fn full_pass_runs_every_job_in_order() {
        let mut db = Database::open_in_memory().unwrap();
        seed_session(&mut db, "s1", "movie", &[(0, 3_600), (100, 400), (100, 400)]);

        let reports = db
            .run_all_maintenance(JobMode::Apply, &MaintenanceConfig::default())
            .unwrap();
        let ops: Vec<MaintenanceOp> = reports.iter().map(|(op, _)| *op).collect();
        assert_eq!(ops, MaintenanceOp::ALL.to_vec());
        assert_eq!(interval_spans(&db), vec![(100, 400)]);

        let second = db
            .run_all_maintenance(JobMode::Apply, &MaintenanceConfig::default())
            .unwrap();
        assert!(second.iter().all(|(_, report)| report.rows_changed == 0));
        assert_eq!(db.list_jobs(100).unwrap().len(), 10);
    }

    #[test]
    fn invalid_parameters_are_rejected_before_running() {
        let mut db = Database::open_in_memory().unwrap();
        let config = MaintenanceConfig {
            fallback_slack_seconds: -1,
            ..MaintenanceConfig::default()
        };
        assert!(matches!(
            db.run_maintenance(MaintenanceOp::FixFallback, JobMode::Apply, &config),
            Err(DbError::InvalidParameter { name: "slack_seconds", .. })
        ));
        assert!(db.normalize_units(JobMode::Apply, Seconds::ZERO).is_err());
        assert!(db.list_jobs(10).unwrap().is_empty());
    }

    #[test]
    fn operation_names_round_trip() {
        for op in MaintenanceOp::ALL {
            assert_eq!(op.as_str().parse::<MaintenanceOp>().unwrap(), op);
        }
        assert!("vacuum".parse::<MaintenanceOp>().is_err());
        assert_eq!(JobMode::from_dry_run(true), JobMode::DryRun);
    }
}
