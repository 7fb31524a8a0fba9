use thiserror::Error;

/// Errors that can occur while talking to the transaction store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No transaction with the given ID exists.
    #[error("transaction not found: {id}")]
    NotFound { id: i64 },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schema is missing or a stored value cannot be interpreted.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// A thread panicked while holding the connection.
    #[error("store connection poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
