use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// Storage format for every timestamp column. Fixed width and UTC, so string
/// comparison in SQL matches chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Upper bound on the `output` and `exception` columns of a log row, in chars.
pub const MAX_LOG_TEXT: usize = 16_777_215;

/// Default priority; lower weights are dispatched first.
pub const DEFAULT_WEIGHT: i32 = 10;

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ").map(|naive| naive.and_utc())
}

/// Keep at most `max` characters of `text`, cutting on a char boundary.
pub fn truncate_text(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_owned(),
        None => text.to_owned(),
    }
}

/// A persisted transaction row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub id: i64,
    /// Job type identifier, resolved through the job registry.
    pub classname: String,
    pub created: DateTime<Utc>,
    /// `None` means parked; a value at or before now means runnable.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Serialized JSON payload.
    pub data: String,
    pub retry_attempt: u32,
    pub recurring: bool,
    pub completed: bool,
    pub failed: bool,
    pub locked: bool,
    pub parallel: bool,
    pub weight: i32,
}

/// Values for a transaction that has not been inserted yet.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub classname: String,
    pub data: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurring: bool,
    pub parallel: bool,
    pub weight: i32,
}

impl NewTransaction {
    /// A parallel, non-recurring, default-weight transaction scheduled for now.
    pub fn new(classname: impl Into<String>) -> Self {
        Self {
            classname: classname.into(),
            data: String::new(),
            scheduled_at: Some(Utc::now()),
            recurring: false,
            parallel: true,
            weight: DEFAULT_WEIGHT,
        }
    }
}

/// Column-level update of one transaction row. Only `Some` fields are
/// written; everything else keeps whatever another writer stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionChanges {
    /// `Some(None)` parks the transaction.
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
    pub data: Option<String>,
    pub retry_attempt: Option<u32>,
    pub recurring: Option<bool>,
    pub completed: Option<bool>,
    pub failed: Option<bool>,
    pub locked: Option<bool>,
}

impl TransactionChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One execution attempt (or retry) of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub transaction_id: i64,
    pub created: DateTime<Utc>,
    pub output: String,
    pub failed: bool,
    pub exception: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLog {
    pub transaction_id: i64,
    pub failed: bool,
    pub output: String,
    pub exception: Option<String>,
    /// Defaults to now when `None`.
    pub created: Option<DateTime<Utc>>,
}
