//! Maintenance audit log.

use std::fmt;

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::maintenance::{JobMode, JobReport, MaintenanceOp};
use crate::{Database, DbError, count_to_i64, format_timestamp};

/// Lifecycle of a maintenance run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown status {other}")),
        }
    }
}

/// One row of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub operation: MaintenanceOp,
    pub dry_run: bool,
    pub status: JobStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub candidates_examined: i64,
    pub rows_changed: i64,
    pub seconds_adjusted: i64,
    pub summary: Option<Value>,
}

struct RawJobRow {
    id: String,
    operation: String,
    dry_run: bool,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    candidates_examined: i64,
    rows_changed: i64,
    seconds_adjusted: i64,
    summary: Option<String>,
}

impl RawJobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            operation: row.get(1)?,
            dry_run: row.get(2)?,
            status: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            candidates_examined: row.get(6)?,
            rows_changed: row.get(7)?,
            seconds_adjusted: row.get(8)?,
            summary: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, DbError> {
        let invalid = |message: String| DbError::InvalidJobRecord {
            job_id: self.id.clone(),
            message,
        };
        let operation = self.operation.parse().map_err(invalid)?;
        let status = self.status.parse().map_err(invalid)?;
        let summary = self
            .summary
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;
        Ok(JobRecord {
            id: self.id,
            operation,
            dry_run: self.dry_run,
            status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            candidates_examined: self.candidates_examined,
            rows_changed: self.rows_changed,
            seconds_adjusted: self.seconds_adjusted,
            summary,
        })
    }
}

const JOB_COLUMNS: &str = "id, operation, dry_run, status, started_at, completed_at, \
     candidates_examined, rows_changed, seconds_adjusted, summary";

impl Database {
    /// Records the start of a run. Written outside the job's transaction so it
    /// survives a rollback.
    pub(crate) fn begin_job(
        &self,
        op: MaintenanceOp,
        mode: JobMode,
        parameters: &Value,
    ) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "
            INSERT INTO maintenance_jobs (id, operation, dry_run, status, started_at, summary)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                id,
                op.as_str(),
                mode.is_dry_run(),
                JobStatus::Running.as_str(),
                format_timestamp(Utc::now()),
                serde_json::to_string(parameters)?,
            ],
        )?;
        Ok(id)
    }

    pub(crate) fn complete_job(&self, id: &str, report: &JobReport) -> Result<(), DbError> {
        self.conn.execute(
            "
            UPDATE maintenance_jobs
            SET status = ?, completed_at = ?, candidates_examined = ?, rows_changed = ?,
                seconds_adjusted = ?
            WHERE id = ?
            ",
            params![
                JobStatus::Completed.as_str(),
                format_timestamp(Utc::now()),
                count_to_i64(report.candidates_examined),
                count_to_i64(report.rows_changed),
                report.seconds_adjusted,
                id,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn fail_job(
        &self,
        id: &str,
        parameters: &Value,
        error: &DbError,
    ) -> Result<(), DbError> {
        let mut summary = parameters.clone();
        if let Value::Object(map) = &mut summary {
            map.insert("error".to_string(), Value::String(error.to_string()));
        }
        self.conn.execute(
            "
            UPDATE maintenance_jobs
            SET status = ?, completed_at = ?, summary = ?
            WHERE id = ?
            ",
            params![
                JobStatus::Failed.as_str(),
                format_timestamp(Utc::now()),
                serde_json::to_string(&summary)?,
                id,
            ],
        )?;
        Ok(())
    }

    /// Lists the most recent runs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {JOB_COLUMNS}
            FROM maintenance_jobs
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?
            "
        ))?;
        let rows = stmt.query_map([count_to_i64(limit)], RawJobRow::from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_record()?);
        }
        Ok(jobs)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, DbError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM maintenance_jobs WHERE id = ?"),
                [id],
                RawJobRow::from_row,
            )
            .optional()?;
        raw.map(RawJobRow::into_record).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_lifecycle_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        let parameters = json!({ "slack_seconds": 120 });
        let id = db
            .begin_job(MaintenanceOp::FixFallback, JobMode::Apply, &parameters)
            .unwrap();

        let running = db.get_job(&id).unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.completed_at, None);
        assert_eq!(running.summary, Some(parameters));

        let report = JobReport {
            candidates_examined: 3,
            rows_changed: 2,
            seconds_adjusted: 500,
            dry_run: false,
        };
        db.complete_job(&id, &report).unwrap();

        let done = db.get_job(&id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.operation, MaintenanceOp::FixFallback);
        assert!(!done.dry_run);
        assert_eq!(done.candidates_examined, 3);
        assert_eq!(done.rows_changed, 2);
        assert_eq!(done.seconds_adjusted, 500);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn failure_message_lands_in_summary() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .begin_job(MaintenanceOp::Dedupe, JobMode::DryRun, &json!({}))
            .unwrap();
        let error = DbError::InvalidParameter {
            name: "slack_seconds",
            value: -1,
        };
        db.fail_job(&id, &json!({}), &error).unwrap();

        let failed = db.get_job(&id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.dry_run);
        assert_eq!(
            failed.summary,
            Some(json!({ "error": "invalid slack_seconds: -1" }))
        );
    }

    #[test]
    fn list_jobs_is_newest_first_and_limited() {
        let db = Database::open_in_memory().unwrap();
        let first = db
            .begin_job(MaintenanceOp::Dedupe, JobMode::Apply, &json!({}))
            .unwrap();
        let second = db
            .begin_job(MaintenanceOp::RemoveSupersets, JobMode::Apply, &json!({}))
            .unwrap();

        let jobs = db.list_jobs(10).unwrap();
        let ids: Vec<&str> = jobs.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        assert_eq!(db.list_jobs(1).unwrap().len(), 1);
        assert!(db.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn corrupt_status_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .begin_job(MaintenanceOp::Dedupe, JobMode::Apply, &json!({}))
            .unwrap();
        db.conn
            .execute(
                "UPDATE maintenance_jobs SET status = 'paused' WHERE id = ?",
                [&id],
            )
            .unwrap();
        let err = db.get_job(&id).unwrap_err();
        assert!(matches!(err, DbError::InvalidJobRecord { .. }));
    }
}
