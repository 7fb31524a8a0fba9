//! `txnd-engine`: persistent job queue execution.
//!
//! # Overview
//!
//! A [`Transaction`] is one persisted unit of deferred work. A single
//! [`Daemon`] per host polls the store for runnable transactions, claims each
//! one under a global claim lock and hands it to one of a fixed pool of
//! [`WorkerSlot`]s. The worker resolves the transaction's classname through
//! the [`Registry`], runs the [`Job`] and records the outcome in the
//! transaction's log.
//!
//! # Dispatch rules
//!
//! | Rule                | Behaviour                                                    |
//! |---------------------|--------------------------------------------------------------|
//! | Runnable            | not completed, not locked, `scheduled_at <= now`             |
//! | Order               | `weight`, then `scheduled_at`, then `id`, ascending          |
//! | Serial jobs         | never more than one running at a time                        |
//! | Claim race          | loser abandons the candidate and moves on                    |
//! | Crash recovery      | every `locked` flag is cleared when a daemon starts          |

pub mod control;
pub mod daemon;
pub mod error;
pub mod health;
pub mod job;
pub mod lockfile;
pub mod monitor;
pub mod retry;
pub mod runner;
pub mod shutdown;
pub mod spawn;
pub mod transaction;
pub mod worker;

pub use daemon::{Daemon, DaemonState, Tick};
pub use error::{EngineError, Result};
pub use job::{Enqueue, Job, JobContext, Registry};
pub use monitor::{Check, Monitor, Snapshot};
pub use retry::BackoffUnit;
pub use runner::Outcome;
pub use spawn::{ProcessSpawner, Spawner, TaskSpawner, WorkerHandle};
pub use transaction::Transaction;
pub use worker::WorkerSlot;
