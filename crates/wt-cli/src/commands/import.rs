//! Import command for loading ingestion records into the local `SQLite` store.
//!
//! Each stdin line is one JSON object tagged by `kind`:
//!
//! ```text
//! {"kind":"session","session_id":"s1","user_id":"u1","item_id":"i1","started_at":1700000000}
//! {"kind":"interval","session_id":"s1","item_id":"i1","user_id":"u1","start_ts":1700000000,"end_ts":1700000300}
//! {"kind":"item","id":"i1","name":"Heat","media_type":"Movie","run_time_ticks":102000000000}
//! {"kind":"close","session_id":"s1","item_id":"i1","ended_at":1700000600}
//! ```

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use wt_core::{ItemId, SessionId};
use wt_db::{Database, IntervalRecord, ItemRecord, SessionRecord};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ImportRecord {
    Session(SessionRecord),
    Interval(IntervalRecord),
    Item(ItemRecord),
    Close {
        session_id: SessionId,
        item_id: ItemId,
        ended_at: i64,
    },
}

/// What an import wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub sessions: usize,
    pub intervals: usize,
    pub items: usize,
    pub closed: usize,
}

pub fn run<W: Write>(writer: &mut W, db: &mut Database) -> Result<ImportSummary> {
    let stdin = io::stdin();
    let summary = import(db, stdin.lock())?;
    writeln!(
        writer,
        "Imported {} sessions, {} intervals, {} items ({} closed)",
        summary.sessions, summary.intervals, summary.items, summary.closed
    )?;
    Ok(summary)
}

fn import<R: BufRead>(db: &mut Database, reader: R) -> Result<ImportSummary> {
    let records = parse_records(reader)?;
    let mut summary = ImportSummary::default();
    for (line, record) in records {
        apply(db, record, &mut summary)
            .with_context(|| format!("failed to store record on line {line}"))?;
    }
    tracing::debug!(?summary, "import finished");
    Ok(summary)
}

fn parse_records<R: BufRead>(reader: R) -> Result<Vec<(usize, ImportRecord)>> {
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: ImportRecord = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid record on line {}", idx + 1))?;
        records.push((idx + 1, record));
    }
    Ok(records)
}

fn apply(db: &mut Database, record: ImportRecord, summary: &mut ImportSummary) -> Result<()> {
    match record {
        ImportRecord::Session(session) => {
            db.upsert_session(&session)?;
            summary.sessions += 1;
        }
        ImportRecord::Interval(interval) => {
            db.insert_interval(&interval)?;
            summary.intervals += 1;
        }
        ImportRecord::Item(item) => {
            db.upsert_item(&item)?;
            summary.items += 1;
        }
        ImportRecord::Close {
            session_id,
            item_id,
            ended_at,
        } => {
            if !db.close_session(&session_id, &item_id, ended_at)? {
                anyhow::bail!("unknown session {session_id} for item {item_id}");
            }
            summary.closed += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    const SESSION: &str = r#"{"kind":"session","session_id":"s1","user_id":"alice","item_id":"X","play_method":"DirectPlay","started_at":0}"#;

    #[test]
    fn import_writes_every_kind() {
        let mut db = Database::open_in_memory().unwrap();
        let input = [
            SESSION,
            "",
            r#"{"kind":"interval","session_id":"s1","item_id":"X","user_id":"alice","start_ts":0,"end_ts":300}"#,
            r#"{"kind":"interval","item_id":"X","user_id":"alice","start_ts":900,"end_ts":1000,"seeked":true}"#,
            r#"{"kind":"item","id":"X","name":"Heat","media_type":"Movie","run_time_ticks":102000000000}"#,
            r#"{"kind":"close","session_id":"s1","item_id":"X","ended_at":1000}"#,
        ]
        .join("\n");

        let summary = import(&mut db, Cursor::new(input)).unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                sessions: 1,
                intervals: 2,
                items: 1,
                closed: 1,
            }
        );

        let stats = db.stats().unwrap();
        assert_eq!(stats.closed_sessions, 1);
        assert_eq!(stats.intervals, 2);
        assert_eq!(stats.detached_intervals, 1);
        assert_eq!(stats.items, 1);
    }

    #[test]
    fn invalid_json_reports_line_number() {
        let mut db = Database::open_in_memory().unwrap();
        let input = format!("{SESSION}\n{{\"kind\":\"session\"");
        let err = import(&mut db, Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("invalid record on line 2"));
    }

    #[test]
    fn empty_ids_are_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let input = r#"{"kind":"item","id":"  "}"#;
        let err = import(&mut db, Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn interval_for_unknown_session_fails_with_context() {
        let mut db = Database::open_in_memory().unwrap();
        let input = r#"{"kind":"interval","session_id":"ghost","item_id":"X","user_id":"alice","start_ts":0,"end_ts":10}"#;
        let err = import(&mut db, Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("failed to store record on line 1"));
    }

    #[test]
    fn closing_unknown_session_fails() {
        let mut db = Database::open_in_memory().unwrap();
        let input = r#"{"kind":"close","session_id":"ghost","item_id":"X","ended_at":10}"#;
        let err = import(&mut db, Cursor::new(input)).unwrap_err();
        assert!(format!("{err:#}").contains("unknown session ghost"));
    }
}
