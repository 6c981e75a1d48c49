//! Next-fire computation for the three schedule kinds.

use std::str::FromStr;
use std::time::Duration;

use alyx_store::ScheduleKind;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Result, ScheduleError};

/// Compute the next fire strictly after `after`.
///
/// Returns `None` when the schedule is exhausted (a one-shot whose time has
/// passed). Cron evaluation happens in the schedule's timezone, so wall-clock
/// expressions stay correct across DST transitions.
pub fn next_fire(
    kind: ScheduleKind,
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::Cron => {
            let tz = parse_timezone(timezone)?;
            let schedule = parse_cron(expression)?;
            Ok(schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }
        ScheduleKind::Interval => {
            let step = parse_duration(expression)?;
            let step = chrono::Duration::from_std(step).map_err(|e| {
                ScheduleError::InvalidExpression {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Some(after + step))
        }
        ScheduleKind::OneTime => {
            let at = DateTime::parse_from_rfc3339(expression)
                .map_err(|e| ScheduleError::InvalidExpression {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                })?
                .with_timezone(&Utc);
            Ok((at > after).then_some(at))
        }
    }
}

/// Interval cadence anchored on the previous due time, not on the wall
/// clock, so late ticks don't drift the schedule. When the anchor has
/// fallen far behind (downtime), the next fire catches up to the first
/// step after `now` instead of replaying every missed window.
pub fn interval_next(
    expression: &str,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let step = parse_duration(expression)?;
    let step = chrono::Duration::from_std(step).map_err(|e| {
        ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })?;
    let mut next = anchor + step;
    while next <= now {
        next += step;
    }
    Ok(next)
}

/// Validate an expression for its kind without computing anything.
pub fn validate(kind: ScheduleKind, expression: &str, timezone: &str) -> Result<()> {
    parse_timezone(timezone)?;
    match kind {
        ScheduleKind::Cron => parse_cron(expression).map(|_| ()),
        ScheduleKind::Interval => parse_duration(expression).map(|_| ()),
        ScheduleKind::OneTime => DateTime::parse_from_rfc3339(expression)
            .map(|_| ())
            .map_err(|e| ScheduleError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}

/// Parse a standard 5-field cron expression (minute, hour, day-of-month,
/// month, day-of-week). The cron crate wants a seconds column, so one is
/// prepended.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        return Err(ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: format!("expected 5 fields, got {fields}"),
        });
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse duration strings like `30s`, `5m`, `1h30m`, `2d`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = |reason: &str| ScheduleError::InvalidExpression {
        expression: s.to_string(),
        reason: reason.to_string(),
    };

    let mut total_secs: u64 = 0;
    let mut digits = String::new();
    for c in s.trim().chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| invalid("unit without a number"))?;
        digits.clear();
        let multiplier = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };
        total_secs += value * multiplier;
    }
    if !digits.is_empty() {
        return Err(invalid("trailing number without a unit"));
    }
    if total_secs == 0 {
        return Err(invalid("duration must be positive"));
    }
    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn bad_durations_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("90").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn five_field_cron_is_normalized() {
        assert!(parse_cron("0 2 * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        // six fields are not the public format
        assert!(parse_cron("0 0 2 * * *").is_err());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn interval_next_is_drift_free() {
        let anchor = utc("2026-01-01T00:00:00Z");
        // tick ran 7 s late; the cadence stays on the 30 s grid
        let now = utc("2026-01-01T00:00:07Z");
        assert_eq!(
            interval_next("30s", anchor, now).unwrap(),
            utc("2026-01-01T00:00:30Z")
        );
    }

    #[test]
    fn interval_next_catches_up_after_downtime() {
        let anchor = utc("2026-01-01T00:00:00Z");
        let now = utc("2026-01-01T03:10:00Z");
        // missed windows are not replayed; next lands on the first grid
        // point after now
        assert_eq!(
            interval_next("1h", anchor, now).unwrap(),
            utc("2026-01-01T04:00:00Z")
        );
    }

    #[test]
    fn one_time_in_the_past_is_exhausted() {
        let after = utc("2026-06-01T00:00:00Z");
        assert_eq!(
            next_fire(ScheduleKind::OneTime, "2026-05-01T00:00:00Z", "UTC", after).unwrap(),
            None
        );
        assert_eq!(
            next_fire(ScheduleKind::OneTime, "2026-07-01T00:00:00Z", "UTC", after).unwrap(),
            Some(utc("2026-07-01T00:00:00Z"))
        );
    }

    #[test]
    fn cron_next_in_utc() {
        let after = utc("2026-08-01T10:30:00Z");
        assert_eq!(
            next_fire(ScheduleKind::Cron, "0 2 * * *", "UTC", after).unwrap(),
            Some(utc("2026-08-02T02:00:00Z"))
        );
    }

    #[test]
    fn cron_spring_forward_keeps_wall_clock() {
        // US DST begins 2026-03-08 at 02:00 local: the clock jumps straight
        // to 03:00 EDT. The 02:00 wall-clock fire lands on March 9; a
        // 23-hour gap; not at 03:00 on March 8.
        let after = utc("2026-03-08T07:00:00Z"); // 03:00 EDT, just past the jump
        let next = next_fire(ScheduleKind::Cron, "0 2 * * *", "America/New_York", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc("2026-03-09T06:00:00Z")); // 02:00 EDT March 9
        assert_eq!((next - after).num_hours(), 23);
    }

    #[test]
    fn cron_fall_back_keeps_wall_clock() {
        // US DST ends 2026-11-01; 02:00 EST on Nov 1 is 07:00 UTC.
        let after = utc("2026-10-31T12:00:00Z");
        let next = next_fire(ScheduleKind::Cron, "0 2 * * *", "America/New_York", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, utc("2026-11-01T07:00:00Z"));
    }

    #[test]
    fn unknown_timezone_rejected() {
        let err = next_fire(
            ScheduleKind::Cron,
            "0 2 * * *",
            "Mars/Olympus_Mons",
            Utc::now(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn validate_checks_by_kind() {
        assert!(validate(ScheduleKind::Cron, "0 2 * * *", "UTC").is_ok());
        assert!(validate(ScheduleKind::Cron, "bogus", "UTC").is_err());
        assert!(validate(ScheduleKind::Interval, "5m", "UTC").is_ok());
        assert!(validate(ScheduleKind::Interval, "soon", "UTC").is_err());
        assert!(validate(ScheduleKind::OneTime, "2026-01-01T00:00:00Z", "UTC").is_ok());
        assert!(validate(ScheduleKind::OneTime, "tomorrow", "UTC").is_err());
    }
}
