use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use txnd_store::Store;

use crate::error::Result;
use crate::lockfile::{ensure_parent_dir, write_atomic};
use crate::transaction::Transaction;

/// Time format of `last_update` and `last_successful`.
pub const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `last_successful` result when no job has ever succeeded.
pub const EMPTY_LOG_SENTINEL: &str = "0000-00-00 00:00:00";

/// One health check: a JSON result and a human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub result: Value,
    pub message: String,
}

impl Check {
    fn ok(result: Value, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
        }
    }

    /// A check whose query failed: `null` result, error text as message.
    fn errored(error: impl std::fmt::Display) -> Self {
        Self {
            result: Value::Null,
            message: error.to_string(),
        }
    }
}

/// Health snapshot written by the daemon on every liveness refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub database: Check,
    pub recurring: Check,
    pub last_update: Check,
    pub runnable: Check,
    pub last_successful: Check,
}

impl Snapshot {
    /// Checks in key order.
    pub fn checks(&self) -> [(&'static str, &Check); 5] {
        [
            ("database", &self.database),
            ("recurring", &self.recurring),
            ("last_update", &self.last_update),
            ("runnable", &self.runnable),
            ("last_successful", &self.last_successful),
        ]
    }
}

pub struct Monitor {
    store: Store,
    path: Option<PathBuf>,
}

impl Monitor {
    pub fn new(store: Store, path: Option<PathBuf>) -> Self {
        Self { store, path }
    }

    /// Query every check. Never fails; a failed query shows up in its check.
    pub fn collect(&self) -> Snapshot {
        Snapshot {
            database: self.database(),
            recurring: self.recurring(),
            last_update: Check::ok(json!(Utc::now().format(SNAPSHOT_TIME_FORMAT).to_string()), ""),
            runnable: match Transaction::count_runnable(&self.store) {
                Ok(count) => Check::ok(json!(count), ""),
                Err(e) => Check::errored(e),
            },
            last_successful: self.last_successful(),
        }
    }

    /// Collect and overwrite the snapshot file. No file configured: no-op.
    pub fn run(&self) -> Result<Option<Snapshot>> {
        let Some(path) = self.path.as_deref() else {
            return Ok(None);
        };
        let snapshot = self.collect();
        ensure_parent_dir(path)?;
        write_atomic(path, &serde_json::to_vec_pretty(&snapshot)?)?;
        debug!(path = %path.display(), "monitor snapshot written");
        Ok(Some(snapshot))
    }

    /// Read a snapshot written by a running daemon.
    pub fn read(path: impl AsRef<Path>) -> Result<Snapshot> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn database(&self) -> Check {
        match self.store.ping() {
            Ok(()) => Check::ok(json!(true), "Database connection ok"),
            Err(e) => Check::ok(json!(false), e.to_string()),
        }
    }

    fn recurring(&self) -> Check {
        match Transaction::failed_recurring(&self.store) {
            Ok(stuck) => {
                let names: Vec<&str> = stuck.iter().map(Transaction::classname).collect();
                Check::ok(json!(stuck.len()), names.join(", "))
            }
            Err(e) => Check::errored(e),
        }
    }

    fn last_successful(&self) -> Check {
        let last = match self.store.last_successful_log() {
            Ok(last) => last,
            Err(e) => return Check::errored(e),
        };
        let Some(log) = last else {
            return Check::ok(json!(EMPTY_LOG_SENTINEL), "Transaction log is empty");
        };
        let at = log.created.format(SNAPSHOT_TIME_FORMAT).to_string();
        match self.store.get(log.transaction_id) {
            Ok(tx) => Check::ok(json!(at), format!("Transaction {}: {}", tx.id, tx.classname)),
            // the transaction row may have been deleted since
            Err(_) => Check::ok(json!(at), format!("Transaction {}", log.transaction_id)),
        }
    }
}
