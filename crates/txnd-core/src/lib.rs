//! `txnd-core`: configuration and shared error type for the transaction daemon.

pub mod config;
pub mod error;

pub use config::{DaemonConfig, DatabaseConfig, MonitorConfig, TxndConfig, WorkerMode};
pub use error::{Result, TxndError};
