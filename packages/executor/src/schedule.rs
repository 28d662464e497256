//! Replication schedule grammar.
//!
//! Protection groups carry a schedule string in a restricted cron-like
//! grammar, or one of a handful of named intervals. The grammar is closed:
//! anything outside it is a validation error surfaced to the operator, never
//! silently coerced to a default interval.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unrecognized schedule: {0:?}")]
    Unrecognized(String),
    #[error("schedule interval out of range: {0:?}")]
    OutOfRange(String),
}

/// A parsed replication schedule, normalized to an interval in minutes.
///
/// Recognized forms:
///
/// | Input                | Interval (minutes) |
/// |----------------------|--------------------|
/// | `*/N * * * *`        | N (1–59)           |
/// | `0 */N * * *`        | N × 60 (N 1–23)    |
/// | `M * * * *`          | 60 (M 0–59)        |
/// | `0 0 * * *`          | 1440               |
/// | `Hourly`             | 60                 |
/// | `Daily`              | 1440               |
/// | `Every 15 minutes`   | 15                 |
/// | `Every 30 minutes`   | 30                 |
/// | `Every 4 hours`      | 240                |
/// | `Every 6 hours`      | 360                |
/// | `Every 12 hours`     | 720                |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationSchedule {
    interval_minutes: u32,
}

impl ReplicationSchedule {
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::Unrecognized(input.to_string()));
        }

        if let Some(minutes) = parse_named(trimmed) {
            return Ok(Self {
                interval_minutes: minutes,
            });
        }
        parse_cron(trimmed).map(|interval_minutes| Self { interval_minutes })
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    pub fn interval(&self) -> Duration {
        Duration::minutes(i64::from(self.interval_minutes))
    }

    /// Whether a sync is due: never synced, or the interval has elapsed.
    pub fn is_due(&self, last_sync: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_sync {
            None => true,
            Some(last) => now - last >= self.interval(),
        }
    }

    /// When the next sync should occur, counted from now.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.interval()
    }
}

fn parse_named(input: &str) -> Option<u32> {
    match input.to_ascii_lowercase().as_str() {
        "hourly" => Some(60),
        "daily" => Some(1440),
        "every 15 minutes" => Some(15),
        "every 30 minutes" => Some(30),
        "every 4 hours" => Some(240),
        "every 6 hours" => Some(360),
        "every 12 hours" => Some(720),
        _ => None,
    }
}

fn parse_cron(input: &str) -> Result<u32, ScheduleError> {
    let fields: Vec<&str> = input.split_whitespace().collect();
    if fields.len() != 5 || fields[2..] != ["*", "*", "*"] {
        return Err(ScheduleError::Unrecognized(input.to_string()));
    }
    let (minute, hour) = (fields[0], fields[1]);

    // "*/N * * * *": every N minutes
    if let Some(n) = minute.strip_prefix("*/") {
        if hour != "*" {
            return Err(ScheduleError::Unrecognized(input.to_string()));
        }
        let n: u32 = n
            .parse()
            .map_err(|_| ScheduleError::Unrecognized(input.to_string()))?;
        if !(1..=59).contains(&n) {
            return Err(ScheduleError::OutOfRange(input.to_string()));
        }
        return Ok(n);
    }

    // "0 */N * * *": every N hours
    if let Some(n) = hour.strip_prefix("*/") {
        if minute != "0" {
            return Err(ScheduleError::Unrecognized(input.to_string()));
        }
        let n: u32 = n
            .parse()
            .map_err(|_| ScheduleError::Unrecognized(input.to_string()))?;
        if !(1..=23).contains(&n) {
            return Err(ScheduleError::OutOfRange(input.to_string()));
        }
        return Ok(n * 60);
    }

    let minute_val: u32 = minute
        .parse()
        .map_err(|_| ScheduleError::Unrecognized(input.to_string()))?;
    if minute_val > 59 {
        return Err(ScheduleError::OutOfRange(input.to_string()));
    }

    // "0 0 * * *": daily at midnight
    if hour == "0" && minute_val == 0 {
        return Ok(1440);
    }

    // "M * * * *": hourly at a fixed minute
    if hour == "*" {
        return Ok(60);
    }

    Err(ScheduleError::Unrecognized(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minutes(input: &str) -> Result<u32, ScheduleError> {
        ReplicationSchedule::parse(input).map(|s| s.interval_minutes())
    }

    #[test]
    fn test_cron_forms() {
        assert_eq!(minutes("*/15 * * * *"), Ok(15));
        assert_eq!(minutes("*/5 * * * *"), Ok(5));
        assert_eq!(minutes("0 */4 * * *"), Ok(240));
        assert_eq!(minutes("0 * * * *"), Ok(60));
        assert_eq!(minutes("30 * * * *"), Ok(60));
        assert_eq!(minutes("0 0 * * *"), Ok(1440));
    }

    #[test]
    fn test_named_forms() {
        assert_eq!(minutes("Hourly"), Ok(60));
        assert_eq!(minutes("daily"), Ok(1440));
        assert_eq!(minutes("Every 15 minutes"), Ok(15));
        assert_eq!(minutes("every 30 minutes"), Ok(30));
        assert_eq!(minutes("Every 4 hours"), Ok(240));
        assert_eq!(minutes("Every 6 hours"), Ok(360));
        assert_eq!(minutes("Every 12 hours"), Ok(720));
    }

    #[test]
    fn test_unrecognized_is_an_error_not_a_fallback() {
        for bad in [
            "",
            "whenever",
            "Every 7 fortnights",
            "* * * * *",
            "*/15 */2 * * *",
            "0 0 1 * *",
            "15 3 * * MON",
            "*/0 * * * *",
            "*/60 * * * *",
            "0 */24 * * *",
            "61 * * * *",
        ] {
            assert!(minutes(bad).is_err(), "expected {bad:?} to be rejected");
        }
    }

    #[test]
    fn test_is_due() {
        let schedule = ReplicationSchedule::parse("*/15 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        assert!(schedule.is_due(None, now));
        assert!(schedule.is_due(Some(now - Duration::minutes(16)), now));
        assert!(schedule.is_due(Some(now - Duration::minutes(15)), now));
        assert!(!schedule.is_due(Some(now - Duration::minutes(14)), now));
    }

    #[test]
    fn test_next_after() {
        let schedule = ReplicationSchedule::parse("Hourly").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(schedule.next_after(now), now + Duration::minutes(60));
    }
}
