//! Status command for showing what the store holds.

use std::io::Write;

use anyhow::Result;

use wt_db::Database;

use crate::Config;

pub fn run<W: Write>(writer: &mut W, db: &Database, config: &Config) -> Result<()> {
    let stats = db.stats()?;

    writeln!(writer, "Watch-time ledger status")?;
    writeln!(writer, "Database: {}", config.database_path.display())?;
    writeln!(
        writer,
        "Sessions: {} active, {} closed",
        stats.active_sessions, stats.closed_sessions
    )?;
    writeln!(
        writer,
        "Intervals: {} ({} malformed, {} without session)",
        stats.intervals, stats.malformed_intervals, stats.detached_intervals
    )?;
    writeln!(writer, "Items: {}", stats.items)?;

    match stats.last_maintenance_at {
        Some(last) => writeln!(
            writer,
            "Maintenance runs: {} (last {last})",
            stats.maintenance_runs
        )?,
        None => writeln!(writer, "Maintenance runs: none")?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use insta::assert_snapshot;
    use wt_core::{ItemId, SessionId, Ticks, UserId};
    use wt_db::{IntervalRecord, ItemRecord, SessionRecord};

    fn session(id: &str, item: &str) -> SessionRecord {
        SessionRecord {
            session_id: SessionId::new(id).unwrap(),
            user_id: UserId::new("alice").unwrap(),
            item_id: ItemId::new(item).unwrap(),
            device_id: None,
            client_name: None,
            play_method: None,
            video_method: None,
            audio_method: None,
            video_codec_from: None,
            video_codec_to: None,
            audio_codec_from: None,
            audio_codec_to: None,
            transcode_reasons: Vec::new(),
            started_at: 0,
        }
    }

    fn interval(session_id: Option<&str>, item: &str, start: i64, end: i64) -> IntervalRecord {
        IntervalRecord {
            session_id: session_id.map(|id| SessionId::new(id).unwrap()),
            item_id: ItemId::new(item).unwrap(),
            user_id: UserId::new("alice").unwrap(),
            start_ts: start,
            end_ts: end,
            start_pos_ticks: Ticks::ZERO,
            end_pos_ticks: Ticks::ZERO,
            duration_seconds: None,
            seeked: false,
        }
    }

    #[test]
    fn status_command_outputs_store_counts() {
        let temp = tempfile::tempdir().unwrap();
        let db_path = temp.path().join("wt.db");
        let mut db = Database::open(&db_path).unwrap();

        db.upsert_session(&session("s1", "movie")).unwrap();
        db.upsert_session(&session("s2", "episode")).unwrap();
        db.close_session(
            &SessionId::new("s2").unwrap(),
            &ItemId::new("episode").unwrap(),
            600,
        )
        .unwrap();
        db.insert_interval(&interval(Some("s1"), "movie", 0, 300))
            .unwrap();
        db.insert_interval(&interval(Some("s1"), "movie", 400, 350))
            .unwrap();
        db.insert_interval(&interval(None, "movie", 0, 60)).unwrap();
        db.upsert_item(&ItemRecord {
            id: ItemId::new("movie").unwrap(),
            name: Some("Movie".to_string()),
            media_type: Some("Movie".to_string()),
            series_id: None,
            series_name: None,
            run_time_ticks: None,
            server_id: None,
            server_type: None,
        })
        .unwrap();

        let config = Config {
            database_path: db_path.clone(),
            ..Config::default()
        };
        let mut output = Vec::new();
        run(&mut output, &db, &config).unwrap();

        let output = String::from_utf8(output).unwrap();
        let output = output.replace(&db_path.display().to_string(), "[TEMP]/wt.db");
        assert_snapshot!(output);
    }
}
