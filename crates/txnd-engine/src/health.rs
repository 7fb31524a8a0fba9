use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;

use crate::monitor::{Check, Snapshot, SNAPSHOT_TIME_FORMAT};

/// More runnable jobs than this is a backlog.
pub const RUNNABLE_BACKLOG_LIMIT: u64 = 500;

/// A snapshot older than this means the daemon stopped refreshing.
pub const LAST_UPDATE_MAX_AGE_SECS: i64 = 60;

/// No success within this window is suspicious.
pub const LAST_SUCCESS_MAX_AGE_SECS: i64 = 24 * 60 * 60;

const OK: u16 = 200;
const WARNING: u16 = 400;
const CRITICAL: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub status: u16,
    pub message: String,
}

/// Judge a snapshot. The most severe failing check decides the status; ties
/// go to the first check in key order.
pub fn evaluate(snapshot: &Snapshot, now: DateTime<Utc>) -> Verdict {
    let mut verdict = Verdict {
        status: OK,
        message: "OK".to_string(),
    };
    let graded = [
        ("database", &snapshot.database, database(&snapshot.database)),
        ("recurring", &snapshot.recurring, recurring(&snapshot.recurring)),
        ("last_update", &snapshot.last_update, last_update(&snapshot.last_update, now)),
        ("runnable", &snapshot.runnable, runnable(&snapshot.runnable)),
        (
            "last_successful",
            &snapshot.last_successful,
            last_successful(&snapshot.last_successful, now),
        ),
    ];
    for (key, check, status) in graded {
        if status > verdict.status {
            verdict = Verdict {
                status,
                message: format!("check_{key}: {}", check.message),
            };
        }
    }
    verdict
}

/// Compare the presented `x-authentication` value with the configured secret.
/// Without a configured secret every request is allowed.
pub fn authorize(presented: Option<&str>, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => presented == Some(expected),
    }
}

fn database(check: &Check) -> u16 {
    if check.result.as_bool() == Some(true) {
        OK
    } else {
        CRITICAL
    }
}

fn recurring(check: &Check) -> u16 {
    match check.result.as_u64() {
        Some(0) => OK,
        _ => WARNING,
    }
}

fn runnable(check: &Check) -> u16 {
    match check.result.as_u64() {
        Some(count) if count <= RUNNABLE_BACKLOG_LIMIT => OK,
        _ => WARNING,
    }
}

fn last_update(check: &Check, now: DateTime<Utc>) -> u16 {
    match age(check, now) {
        Some(age) if age <= Duration::seconds(LAST_UPDATE_MAX_AGE_SECS) => OK,
        _ => CRITICAL,
    }
}

fn last_successful(check: &Check, now: DateTime<Utc>) -> u16 {
    match age(check, now) {
        Some(age) if age <= Duration::seconds(LAST_SUCCESS_MAX_AGE_SECS) => OK,
        _ => WARNING,
    }
}

fn age(check: &Check, now: DateTime<Utc>) -> Option<Duration> {
    let at = NaiveDateTime::parse_from_str(check.result.as_str()?, SNAPSHOT_TIME_FORMAT)
        .ok()?
        .and_utc();
    Some(now - at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(result: serde_json::Value, message: &str) -> Check {
        Check {
            result,
            message: message.to_string(),
        }
    }

    fn stamp(at: DateTime<Utc>) -> serde_json::Value {
        json!(at.format(SNAPSHOT_TIME_FORMAT).to_string())
    }

    fn healthy(now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            database: check(json!(true), "Database connection ok"),
            recurring: check(json!(0), ""),
            last_update: check(stamp(now - Duration::seconds(5)), ""),
            runnable: check(json!(3), ""),
            last_successful: check(stamp(now - Duration::hours(2)), "Transaction 9: mailer"),
        }
    }

    #[test]
    fn healthy_snapshot_is_ok() {
        let now = Utc::now();
        assert_eq!(evaluate(&healthy(now), now).status, 200);
    }

    #[test]
    fn warnings_return_400() {
        let now = Utc::now();
        let mut snapshot = healthy(now);
        snapshot.runnable = check(json!(501), "");
        assert_eq!(evaluate(&snapshot, now).status, 400);

        let mut snapshot = healthy(now);
        snapshot.recurring = check(json!(1), "cleanup");
        let verdict = evaluate(&snapshot, now);
        assert_eq!(verdict.status, 400);
        assert_eq!(verdict.message, "check_recurring: cleanup");
    }

    #[test]
    fn empty_log_sentinel_is_a_warning() {
        let now = Utc::now();
        let mut snapshot = healthy(now);
        snapshot.last_successful =
            check(json!(crate::monitor::EMPTY_LOG_SENTINEL), "Transaction log is empty");
        let verdict = evaluate(&snapshot, now);
        assert_eq!(verdict.status, 400);
        assert_eq!(verdict.message, "check_last_successful: Transaction log is empty");
    }

    #[test]
    fn critical_beats_warning() {
        let now = Utc::now();
        let mut snapshot = healthy(now);
        snapshot.recurring = check(json!(2), "a, b");
        snapshot.last_update = check(stamp(now - Duration::minutes(5)), "");
        let verdict = evaluate(&snapshot, now);
        assert_eq!(verdict.status, 500);
        assert_eq!(verdict.message, "check_last_update: ");
    }

    #[test]
    fn database_down_is_critical() {
        let now = Utc::now();
        let mut snapshot = healthy(now);
        snapshot.database = check(json!(false), "disk I/O error");
        let verdict = evaluate(&snapshot, now);
        assert_eq!(verdict.status, 500);
        assert_eq!(verdict.message, "check_database: disk I/O error");
    }

    #[test]
    fn failed_query_counts_as_failing_check() {
        let now = Utc::now();
        let mut snapshot = healthy(now);
        snapshot.runnable = check(serde_json::Value::Null, "no such table");
        assert_eq!(evaluate(&snapshot, now).status, 400);
    }

    #[test]
    fn authorization() {
        assert!(authorize(None, None));
        assert!(authorize(Some("anything"), None));
        assert!(authorize(Some("s3cret"), Some("s3cret")));
        assert!(!authorize(Some("wrong"), Some("s3cret")));
        assert!(!authorize(None, Some("s3cret")));
    }
}
