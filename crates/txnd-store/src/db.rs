use rusqlite::Connection;

use crate::error::Result;

/// Initialise the transaction schema in `conn`.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS transactions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            classname     TEXT    NOT NULL,
            created       TEXT    NOT NULL,
            scheduled_at  TEXT,               -- NULL means parked
            data          TEXT    NOT NULL DEFAULT '',
            retry_attempt INTEGER NOT NULL DEFAULT 0,
            recurring     INTEGER NOT NULL DEFAULT 0,
            completed     INTEGER NOT NULL DEFAULT 0,
            failed        INTEGER NOT NULL DEFAULT 0,
            locked        INTEGER NOT NULL DEFAULT 0,
            parallel      INTEGER NOT NULL DEFAULT 1,
            weight        INTEGER NOT NULL DEFAULT 10
        ) STRICT;

        -- Runnable polling: completed/failed/locked filters, then scheduled_at
        CREATE INDEX IF NOT EXISTS idx_transactions_runnable
            ON transactions (completed, failed, locked, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_classname
            ON transactions (classname);

        CREATE TABLE IF NOT EXISTS transaction_log (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id INTEGER NOT NULL,
            created        TEXT    NOT NULL,
            output         TEXT    NOT NULL DEFAULT '',
            failed         INTEGER NOT NULL DEFAULT 0,
            exception      TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_transaction_log_transaction
            ON transaction_log (transaction_id, created);
        CREATE INDEX IF NOT EXISTS idx_transaction_log_failed
            ON transaction_log (failed, created);

        -- Persistent named mutexes (the claim lock lives here)
        CREATE TABLE IF NOT EXISTS claim_locks (
            name        TEXT NOT NULL PRIMARY KEY,
            owner       TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
