use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use txnd_store::{NewTransaction, Store, DEFAULT_WEIGHT};

use crate::error::{EngineError, Result};
use crate::transaction::Transaction;

/// Common interface implemented by every job type.
///
/// A job type is registered under a classname; each transaction row names the
/// classname that executes it. Implementations must be `Send + Sync` so one
/// instance can serve every transaction of its type from any worker.
#[async_trait]
pub trait Job: Send + Sync {
    /// Execute one transaction.
    ///
    /// Anything written to `ctx` becomes the log output of this run. An
    /// `Err` (or a panic) marks the transaction failed; `Ok` marks it
    /// completed unless the job rescheduled it through `ctx.transaction()`.
    async fn run(&self, ctx: &mut JobContext<'_>) -> anyhow::Result<()>;

    /// Serial jobs never run alongside another serial job.
    fn parallel(&self) -> bool {
        true
    }

    /// Dispatch priority; lower runs first.
    fn weight(&self) -> i32 {
        DEFAULT_WEIGHT
    }

    /// Give-up threshold for `Transaction::retry`. `None` retries forever.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// What a running job sees: its transaction and an output buffer.
pub struct JobContext<'a> {
    transaction: &'a mut Transaction,
    output: String,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(transaction: &'a mut Transaction) -> Self {
        Self {
            transaction,
            output: String::new(),
        }
    }

    pub fn transaction(&mut self) -> &mut Transaction {
        self.transaction
    }

    /// Output captured so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub(crate) fn into_output(self) -> String {
        self.output
    }
}

impl fmt::Write for JobContext<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.output.push_str(s);
        Ok(())
    }
}

/// Options for a new transaction.
#[derive(Debug, Clone)]
pub struct Enqueue {
    pub payload: Value,
    /// `None` parks the transaction.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recurring: bool,
}

impl Default for Enqueue {
    fn default() -> Self {
        Self {
            payload: Value::Object(Default::default()),
            scheduled_at: Some(Utc::now()),
            recurring: false,
        }
    }
}

impl Enqueue {
    /// Runnable as soon as a worker is free.
    pub fn now() -> Self {
        Self::default()
    }

    pub fn at(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..Self::default()
        }
    }

    /// Stored but not runnable until scheduled.
    pub fn parked() -> Self {
        Self {
            scheduled_at: None,
            ..Self::default()
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn recurring(mut self, recurring: bool) -> Self {
        self.recurring = recurring;
        self
    }
}

/// Maps classnames to job implementations.
#[derive(Default, Clone)]
pub struct Registry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type, replacing any previous one with the same name.
    pub fn register(&mut self, classname: impl Into<String>, job: impl Job + 'static) -> &mut Self {
        let classname = classname.into();
        info!(classname = %classname, parallel = job.parallel(), "registering job type");
        self.jobs.insert(classname, Arc::new(job));
        self
    }

    pub fn get(&self, classname: &str) -> Result<Arc<dyn Job>> {
        self.jobs
            .get(classname)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJobType(classname.to_string()))
    }

    pub fn contains(&self, classname: &str) -> bool {
        self.jobs.contains_key(classname)
    }

    /// Registered classnames, sorted.
    pub fn classnames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Insert a transaction for a registered job type. `parallel` and
    /// `weight` come from the job type.
    pub fn enqueue(&self, store: &Store, classname: &str, options: Enqueue) -> Result<Transaction> {
        let job = self.get(classname)?;
        let record = store.insert(&NewTransaction {
            classname: classname.to_string(),
            data: serde_json::to_string(&options.payload)?,
            scheduled_at: options.scheduled_at,
            recurring: options.recurring,
            parallel: job.parallel(),
            weight: job.weight(),
        })?;
        info!(
            job_id = record.id,
            classname = %record.classname,
            scheduled_at = ?record.scheduled_at,
            "transaction enqueued"
        );
        Ok(Transaction::new(store.clone(), record).with_max_attempts(job.max_attempts()))
    }

    /// Load a transaction with its job type's retry limit applied.
    pub fn load(&self, store: &Store, id: i64) -> Result<Transaction> {
        let transaction = Transaction::get(store, id)?;
        let max_attempts = self
            .jobs
            .get(transaction.classname())
            .and_then(|job| job.max_attempts());
        Ok(transaction.with_max_attempts(max_attempts))
    }
}
