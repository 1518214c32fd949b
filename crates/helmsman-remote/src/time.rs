//! Timestamp normalization for remote task documents.
//!
//! The remote service emits log lines as `"YYYY-MM-DD_HH:MM:SS message"`
//! and an `updateTime` of `"YYYY-MM-DD HH:MM:SS UTC"`. The zone token
//! `UTC` is not parseable by strptime-style formats, so it is normalized
//! textually to a numeric offset before parsing.

use chrono::{DateTime, NaiveDateTime, Utc};

use helmsman_store::LogEntry;

const LOG_LINE_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";
const UPDATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Parse one remote log line into a timestamped entry.
///
/// Lines that do not carry the expected timestamp prefix are kept whole
/// and stamped with the current time.
pub fn parse_log_line(line: &str) -> LogEntry {
    if let Some((stamp, message)) = line.split_once(' ') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(stamp, LOG_LINE_FORMAT) {
            return LogEntry {
                timestamp: naive.and_utc(),
                message: message.to_string(),
            };
        }
    }
    LogEntry::now(line)
}

/// Normalize a whole remote log into entries with ISO-8601 timestamps.
pub fn normalize_log(lines: &[String]) -> Vec<LogEntry> {
    lines.iter().map(|line| parse_log_line(line)).collect()
}

/// Parse the remote's `updateTime`, normalizing its non-standard zone
/// token to a numeric offset first.
pub fn parse_update_time(value: &str) -> Option<DateTime<Utc>> {
    let normalized = value.trim().replace(" UTC", " +0000").replace(" GMT", " +0000");
    DateTime::parse_from_str(&normalized, UPDATE_TIME_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
