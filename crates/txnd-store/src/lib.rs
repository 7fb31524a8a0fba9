//! `txnd-store`: SQLite persistence for transactions, their execution log and
//! the named claim lock.
//!
//! All access goes through [`Store`], a cheaply cloneable handle around a
//! single connection. Timestamps are stored as fixed-width UTC strings so
//! that SQL comparisons and ordering are lexicographic.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::Store;
pub use types::{
    LogRecord, NewLog, NewTransaction, TransactionChanges, TransactionRecord, DEFAULT_WEIGHT,
};
