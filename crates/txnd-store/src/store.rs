use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{
    format_timestamp, parse_timestamp, truncate_text, LogRecord, NewLog, NewTransaction,
    TransactionChanges, TransactionRecord, MAX_LOG_TEXT,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TRANSACTION_COLUMNS: &str = "id, classname, created, scheduled_at, data, retry_attempt,
     recurring, completed, failed, locked, parallel, weight";

const LOG_COLUMNS: &str = "id, transaction_id, created, output, failed, exception";

/// Shared handle to the transaction store.
///
/// Wraps a single SQLite connection in a `Mutex`; clones share it. Worker
/// processes open their own handle on the same database file, with WAL and a
/// busy timeout so concurrent writers wait instead of failing.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database; only clones of the returned handle see it.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an already-open connection, initialising the schema.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Cheap reachability check: the `transactions` table must exist.
    pub fn ping(&self) -> Result<()> {
        let db = self.conn()?;
        let columns: i64 = db.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('transactions')",
            [],
            |row| row.get(0),
        )?;
        if columns == 0 {
            return Err(StoreError::Corrupt("transactions table is missing".into()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    #[instrument(skip(self, new), fields(classname = %new.classname))]
    pub fn insert(&self, new: &NewTransaction) -> Result<TransactionRecord> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO transactions
             (classname, created, scheduled_at, data, retry_attempt,
              recurring, completed, failed, locked, parallel, weight)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, 0, 0, 0, ?6, ?7)",
            rusqlite::params![
                new.classname,
                format_timestamp(Utc::now()),
                new.scheduled_at.map(format_timestamp),
                new.data,
                new.recurring,
                new.parallel,
                new.weight,
            ],
        )?;
        let id = db.last_insert_rowid();
        debug!(id, "transaction inserted");
        fetch_transaction(&db, id)
    }

    pub fn get(&self, id: i64) -> Result<TransactionRecord> {
        let db = self.conn()?;
        fetch_transaction(&db, id)
    }

    /// Overwrite every mutable column of `record`. Fixtures and admin tools
    /// only; lifecycle code writes through [`Store::apply`].
    #[instrument(skip(self, record), fields(id = record.id))]
    pub fn update(&self, record: &TransactionRecord) -> Result<()> {
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE transactions
             SET scheduled_at = ?1, data = ?2, retry_attempt = ?3, recurring = ?4,
                 completed = ?5, failed = ?6, locked = ?7, parallel = ?8, weight = ?9
             WHERE id = ?10",
            rusqlite::params![
                record.scheduled_at.map(format_timestamp),
                record.data,
                record.retry_attempt,
                record.recurring,
                record.completed,
                record.failed,
                record.locked,
                record.parallel,
                record.weight,
                record.id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound { id: record.id });
        }
        Ok(())
    }

    /// Write only the columns set in `changes`.
    #[instrument(skip(self, changes))]
    pub fn apply(&self, id: i64, changes: &TransactionChanges) -> Result<()> {
        use rusqlite::types::Value;

        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(at) = changes.scheduled_at {
            columns.push("scheduled_at");
            values.push(at.map_or(Value::Null, |at| Value::Text(format_timestamp(at))));
        }
        if let Some(data) = &changes.data {
            columns.push("data");
            values.push(Value::Text(data.clone()));
        }
        if let Some(attempt) = changes.retry_attempt {
            columns.push("retry_attempt");
            values.push(Value::Integer(i64::from(attempt)));
        }
        let flags = [
            ("recurring", changes.recurring),
            ("completed", changes.completed),
            ("failed", changes.failed),
            ("locked", changes.locked),
        ];
        for (column, flag) in flags {
            if let Some(flag) = flag {
                columns.push(column);
                values.push(Value::Integer(i64::from(flag)));
            }
        }
        if columns.is_empty() {
            return Ok(());
        }

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE transactions SET {} WHERE id = ?{}",
            assignments.join(", "),
            columns.len() + 1
        );
        values.push(Value::Integer(id));

        let db = self.conn()?;
        let changed = db.execute(&sql, rusqlite::params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        debug!(id, columns = %columns.join(","), "transaction columns updated");
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let db = self.conn()?;
        let changed = db.execute("DELETE FROM transactions WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(StoreError::NotFound { id });
        }
        Ok(())
    }

    /// Newest first.
    pub fn get_by_classname(
        &self,
        classname: &str,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionRecord>> {
        let db = self.conn()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        query_transactions(
            &db,
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE classname = ?1 ORDER BY id DESC LIMIT ?2"
            ),
            rusqlite::params![classname, limit],
        )
    }

    /// Transactions eligible to run at `now`, in dispatch order.
    pub fn get_runnable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TransactionRecord>> {
        let db = self.conn()?;
        query_transactions(
            &db,
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE scheduled_at IS NOT NULL AND scheduled_at <= ?1
                   AND completed = 0 AND failed = 0 AND locked = 0
                 ORDER BY weight ASC, scheduled_at ASC, id ASC
                 LIMIT ?2"
            ),
            rusqlite::params![format_timestamp(now), limit as i64],
        )
    }

    pub fn count_runnable(&self, now: DateTime<Utc>) -> Result<u64> {
        let db = self.conn()?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM transactions
             WHERE scheduled_at IS NOT NULL AND scheduled_at <= ?1
               AND completed = 0 AND failed = 0 AND locked = 0",
            [format_timestamp(now)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Transactions whose `scheduled_at` lies strictly after `now`.
    pub fn get_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<TransactionRecord>> {
        let db = self.conn()?;
        query_transactions(
            &db,
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE scheduled_at > ?1 ORDER BY scheduled_at ASC, id ASC"
            ),
            [format_timestamp(now)],
        )
    }

    /// Claimed and unfinished transactions, serial ones first.
    pub fn get_running(&self) -> Result<Vec<TransactionRecord>> {
        let db = self.conn()?;
        query_transactions(
            &db,
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE locked = 1 AND completed = 0 ORDER BY parallel ASC, id ASC"
            ),
            [],
        )
    }

    /// Clear every `locked` flag. Only valid while no worker can be running.
    #[instrument(skip(self))]
    pub fn unlock_all(&self) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute("UPDATE transactions SET locked = 0 WHERE locked = 1", [])?;
        if n > 0 {
            warn!(count = n, "stale transaction locks cleared");
        }
        Ok(n)
    }

    /// Recurring transactions that dropped out of rotation.
    pub fn get_failed_recurring(&self) -> Result<Vec<TransactionRecord>> {
        let db = self.conn()?;
        query_transactions(
            &db,
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE recurring = 1 AND (failed = 1 OR completed = 1) ORDER BY id ASC"
            ),
            [],
        )
    }

    // -----------------------------------------------------------------------
    // Transaction log
    // -----------------------------------------------------------------------

    #[instrument(skip(self, new), fields(transaction_id = new.transaction_id, failed = new.failed))]
    pub fn insert_log(&self, new: &NewLog) -> Result<LogRecord> {
        let db = self.conn()?;
        let created = new.created.unwrap_or_else(Utc::now);
        let output = truncate_text(&new.output, MAX_LOG_TEXT);
        let exception = new
            .exception
            .as_deref()
            .map(|e| truncate_text(e, MAX_LOG_TEXT));
        db.execute(
            "INSERT INTO transaction_log (transaction_id, created, output, failed, exception)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                new.transaction_id,
                format_timestamp(created),
                output,
                new.failed,
                exception,
            ],
        )?;
        Ok(LogRecord {
            id: db.last_insert_rowid(),
            transaction_id: new.transaction_id,
            created,
            output,
            failed: new.failed,
            exception,
        })
    }

    /// Log rows of one transaction in chronological order. With a `limit`,
    /// only the most recent `limit` rows are returned.
    pub fn logs_for(&self, transaction_id: i64, limit: Option<usize>) -> Result<Vec<LogRecord>> {
        let db = self.conn()?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = db.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM transaction_log
             WHERE transaction_id = ?1 ORDER BY created DESC, id DESC LIMIT ?2"
        ))?;
        let mut logs = stmt
            .query_map(rusqlite::params![transaction_id, limit], row_to_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        logs.reverse();
        Ok(logs)
    }

    pub fn last_log_for(&self, transaction_id: i64) -> Result<Option<LogRecord>> {
        let db = self.conn()?;
        let log = db
            .query_row(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM transaction_log
                     WHERE transaction_id = ?1 ORDER BY created DESC, id DESC LIMIT 1"
                ),
                [transaction_id],
                row_to_log,
            )
            .optional()?;
        Ok(log)
    }

    /// Most recent successful execution across all transactions.
    pub fn last_successful_log(&self) -> Result<Option<LogRecord>> {
        let db = self.conn()?;
        let log = db
            .query_row(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM transaction_log
                     WHERE failed = 0 ORDER BY created DESC, id DESC LIMIT 1"
                ),
                [],
                row_to_log,
            )
            .optional()?;
        Ok(log)
    }

    // -----------------------------------------------------------------------
    // Named locks
    // -----------------------------------------------------------------------

    /// Take the named lock for `owner` if nobody holds it. Never blocks.
    pub fn try_acquire_lock(&self, name: &str, owner: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "INSERT INTO claim_locks (name, owner, acquired_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO NOTHING",
            rusqlite::params![name, owner, format_timestamp(Utc::now())],
        )?;
        Ok(n == 1)
    }

    /// Release the named lock if `owner` holds it.
    pub fn release_lock(&self, name: &str, owner: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "DELETE FROM claim_locks WHERE name = ?1 AND owner = ?2",
            rusqlite::params![name, owner],
        )?;
        Ok(n == 1)
    }

    /// Release the named lock whoever holds it (crash recovery).
    pub fn force_release_lock(&self, name: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM claim_locks WHERE name = ?1", [name])?;
        if n > 0 {
            warn!(lock = name, "stale claim lock released");
        }
        Ok(n == 1)
    }
}

fn fetch_transaction(db: &Connection, id: i64) -> Result<TransactionRecord> {
    db.query_row(
        &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
        [id],
        row_to_transaction,
    )
    .optional()?
    .ok_or(StoreError::NotFound { id })
}

fn query_transactions<P: rusqlite::Params>(
    db: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<TransactionRecord>> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt
        .query_map(params, row_to_transaction)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => timestamp_column(row, idx).map(Some),
    }
}

/// Map a SQLite row to a `TransactionRecord`.
fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        classname: row.get(1)?,
        created: timestamp_column(row, 2)?,
        scheduled_at: optional_timestamp_column(row, 3)?,
        data: row.get(4)?,
        retry_attempt: row.get(5)?,
        recurring: row.get(6)?,
        completed: row.get(7)?,
        failed: row.get(8)?,
        locked: row.get(9)?,
        parallel: row.get(10)?,
        weight: row.get(11)?,
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogRecord> {
    Ok(LogRecord {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        created: timestamp_column(row, 2)?,
        output: row.get(3)?,
        failed: row.get(4)?,
        exception: row.get(5)?,
    })
}
