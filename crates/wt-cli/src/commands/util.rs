//! Shared utilities for CLI commands.

use std::sync::LazyLock;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use wt_core::TimeWindow;

/// Pre-compiled regex for relative time parsing.
static RELATIVE_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s+(minute|hour|day|week)s?\s+ago$").unwrap());

static UNIX_SECONDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+$").unwrap());

/// Conservative bounds for relative time parsing (~1000 years in minutes).
const MAX_RELATIVE_MINUTES: i64 = 1000 * 365 * 24 * 60;

/// Report window used when no range flag is given.
pub const DEFAULT_REPORT_DAYS: u32 = 30;

/// Parse a point in time as unix seconds.
///
/// Supports:
/// - ISO 8601: "2026-01-15T10:30:00Z"
/// - Unix seconds: "1768473000"
/// - Relative: "2 hours ago", "30 minutes ago", "1 day ago", "1 week ago"
pub fn parse_timestamp(s: &str, now: DateTime<Utc>) -> anyhow::Result<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }

    if UNIX_SECONDS_RE.is_match(s) {
        return s
            .parse()
            .with_context(|| format!("unix timestamp out of range: {s}"));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s) else {
        anyhow::bail!(
            "Invalid time: {s}. Use ISO 8601 (e.g., 2026-01-15T10:30:00Z), unix seconds, or relative (e.g., '2 days ago')"
        );
    };

    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;

    let (max_for_unit, minutes_per_unit) = match &caps[2] {
        "minute" => (MAX_RELATIVE_MINUTES, 1),
        "hour" => (MAX_RELATIVE_MINUTES / 60, 60),
        "day" => (MAX_RELATIVE_MINUTES / (60 * 24), 60 * 24),
        "week" => (MAX_RELATIVE_MINUTES / (60 * 24 * 7), 60 * 24 * 7),
        unit => anyhow::bail!("Unknown time unit: {unit}"),
    };

    if n > max_for_unit {
        anyhow::bail!("Relative time value too large: {n} {}", &caps[2]);
    }

    Ok((now - Duration::minutes(n * minutes_per_unit)).timestamp())
}

/// How a report's time range was requested on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowArgs {
    pub days: Option<u32>,
    pub all_time: bool,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl WindowArgs {
    /// Resolves the flags to a window.
    ///
    /// An open `--start` runs up to `now`; an open `--end` runs from the epoch.
    pub fn resolve(&self, now: DateTime<Utc>) -> anyhow::Result<TimeWindow> {
        if self.all_time {
            return Ok(TimeWindow::all_time());
        }
        if self.start.is_none() && self.end.is_none() {
            return Ok(TimeWindow::last_days(
                now,
                self.days.unwrap_or(DEFAULT_REPORT_DAYS),
            ));
        }
        let start = self
            .start
            .as_deref()
            .map(|s| parse_timestamp(s, now))
            .transpose()?
            .unwrap_or(0);
        let end = self
            .end
            .as_deref()
            .map(|s| parse_timestamp(s, now))
            .transpose()?
            .unwrap_or_else(|| now.timestamp());
        TimeWindow::new(start, end).context("invalid time range")
    }
}

/// Formats seconds as "Xh Ym", or "Xm" under an hour.
#[allow(clippy::cast_possible_truncation)]
pub fn format_duration(seconds: f64) -> String {
    if !seconds.is_finite() || seconds <= 0.0 {
        return "0m".to_string();
    }
    let total_minutes = (seconds / 60.0).floor() as i64;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours >= 1 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let ts = parse_timestamp("2026-01-15T10:00:00Z", now()).unwrap();
        assert_eq!(ts, now().timestamp() - 7_200);
    }

    #[test]
    fn test_parse_timestamp_unix_seconds() {
        assert_eq!(parse_timestamp("1700000000", now()).unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_parse_timestamp_relative() {
        let ts = parse_timestamp("2 days ago", now()).unwrap();
        assert_eq!(ts, now().timestamp() - 2 * 86_400);
        let ts = parse_timestamp("1 week ago", now()).unwrap();
        assert_eq!(ts, now().timestamp() - 7 * 86_400);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday-ish", now()).unwrap_err();
        assert!(err.to_string().contains("Invalid time"));
    }

    #[test]
    fn test_parse_timestamp_rejects_huge_relative() {
        assert!(parse_timestamp("999999999 weeks ago", now()).is_err());
    }

    #[test]
    fn test_window_defaults_to_recent_days() {
        let window = WindowArgs::default().resolve(now()).unwrap();
        assert_eq!(window.end(), now().timestamp());
        assert_eq!(
            window.start(),
            now().timestamp() - i64::from(DEFAULT_REPORT_DAYS) * 86_400
        );
    }

    #[test]
    fn test_window_open_start_runs_to_now() {
        let args = WindowArgs {
            start: Some("100".to_string()),
            ..WindowArgs::default()
        };
        let window = args.resolve(now()).unwrap();
        assert_eq!(window.start(), 100);
        assert_eq!(window.end(), now().timestamp());
    }

    #[test]
    fn test_window_rejects_inverted_range() {
        let args = WindowArgs {
            start: Some("200".to_string()),
            end: Some("100".to_string()),
            ..WindowArgs::default()
        };
        assert!(args.resolve(now()).is_err());
    }

    #[test]
    fn test_all_time_wins() {
        let args = WindowArgs {
            all_time: true,
            ..WindowArgs::default()
        };
        assert_eq!(args.resolve(now()).unwrap(), TimeWindow::all_time());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0m");
        assert_eq!(format_duration(59.0), "0m");
        assert_eq!(format_duration(700.0), "11m");
        assert_eq!(format_duration(5_400.0), "1h 30m");
        assert_eq!(format_duration(-5.0), "0m");
    }
}
