//! The transaction entity and its lifecycle state machine.
//!
//! ```text
//! Parked ──schedule──▶ Scheduled ──lock──▶ Locked ──mark_completed──▶ Completed
//!    ▲                     ▲                  │
//!    └──unschedule─────────┤                  ├──retry──▶ Scheduled (later)
//!                          │                  └──mark_failed──▶ Completed-failed
//! ```
//!
//! Lifecycle methods persist right away and write only the columns they
//! change, so a concurrent writer's edit to another column (an operator
//! parking the row, say) survives a worker's `unlock` or `mark_completed`.
//! The `rescheduled` flag stays in memory; it tells `mark_completed` not to
//! seal a job that re-queued itself during its own run.

use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};
use txnd_store::{LogRecord, NewLog, Store, TransactionChanges, TransactionRecord};

use crate::error::{EngineError, Result};

/// Name of the global claim lock serialising `Transaction::lock`.
pub const CLAIM_LOCK: &str = "transaction_runnable";

/// Default wait for the claim lock before giving up with `LockUnavailable`.
pub const DEFAULT_CLAIM_TIMEOUT: StdDuration = StdDuration::from_secs(2);

const CLAIM_RETRY_INTERVAL: StdDuration = StdDuration::from_millis(5);

/// A transaction row bound to the store it lives in.
pub struct Transaction {
    record: TransactionRecord,
    store: Store,
    /// Columns changed in memory since the last `save`.
    pending: TransactionChanges,
    rescheduled: bool,
    max_attempts: Option<u32>,
    claim_timeout: StdDuration,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("record", &self.record)
            .field("pending", &self.pending)
            .field("rescheduled", &self.rescheduled)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Transaction {
    pub fn new(store: Store, record: TransactionRecord) -> Self {
        Self {
            record,
            store,
            pending: TransactionChanges::default(),
            rescheduled: false,
            max_attempts: None,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    /// Load a transaction by id.
    pub fn get(store: &Store, id: i64) -> Result<Self> {
        let record = store.get(id)?;
        Ok(Self::new(store.clone(), record))
    }

    /// Give-up threshold used by the retry policy (`None` or 0 = unlimited).
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: StdDuration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn classname(&self) -> &str {
        &self.record.classname
    }

    pub fn record(&self) -> &TransactionRecord {
        &self.record
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.record.scheduled_at
    }

    pub fn retry_attempt(&self) -> u32 {
        self.record.retry_attempt
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn is_parallel(&self) -> bool {
        self.record.parallel
    }

    pub fn is_recurring(&self) -> bool {
        self.record.recurring
    }

    pub fn is_completed(&self) -> bool {
        self.record.completed
    }

    pub fn is_failed(&self) -> bool {
        self.record.failed
    }

    pub fn is_locked(&self) -> bool {
        self.record.locked
    }

    /// True once `schedule` ran on this instance.
    pub fn is_rescheduled(&self) -> bool {
        self.rescheduled
    }

    /// Not completed, not locked and due in the future.
    pub fn is_scheduled(&self) -> bool {
        if self.record.completed || self.record.locked {
            return false;
        }
        self.record
            .scheduled_at
            .is_some_and(|at| at >= Utc::now())
    }

    // -----------------------------------------------------------------------
    // Payload
    // -----------------------------------------------------------------------

    /// Decode the payload as a JSON object. An empty payload is an empty map.
    pub fn payload(&self) -> Result<Map<String, Value>> {
        if self.record.data.trim().is_empty() {
            return Ok(Map::new());
        }
        Ok(serde_json::from_str(&self.record.data)?)
    }

    /// Replace the payload. Persisted on the next `save`.
    pub fn set_payload(&mut self, payload: Map<String, Value>) -> Result<()> {
        self.record.data = serde_json::to_string(&Value::Object(payload))?;
        self.pending.data = Some(self.record.data.clone());
        Ok(())
    }

    /// Decode the payload into a typed value.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        if self.record.data.trim().is_empty() {
            return Ok(serde_json::from_value(Value::Object(Map::new()))?);
        }
        Ok(serde_json::from_str(&self.record.data)?)
    }

    /// Encode a typed value as the payload. Persisted on the next `save`.
    pub fn set_data<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.record.data = serde_json::to_string(data)?;
        self.pending.data = Some(self.record.data.clone());
        Ok(())
    }

    /// Persisted on the next `save`.
    pub fn set_recurring(&mut self, recurring: bool) {
        self.record.recurring = recurring;
        self.pending.recurring = Some(recurring);
    }

    pub(crate) fn set_retry_attempt(&mut self, attempt: u32) {
        self.record.retry_attempt = attempt;
        self.pending.retry_attempt = Some(attempt);
    }

    /// Write the columns changed since the last save. Nothing else is
    /// touched.
    pub fn save(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.apply(self.record.id, &self.pending)?;
        self.pending = TransactionChanges::default();
        Ok(())
    }

    /// Re-read the persisted row, discarding unsaved changes.
    pub fn refresh(&mut self) -> Result<()> {
        self.record = self.store.get(self.record.id)?;
        self.pending = TransactionChanges::default();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Make the transaction runnable.
    ///
    /// Without an offset a parked or overdue transaction becomes due now and
    /// a future one keeps its time. With an offset the base is the current
    /// time if it lies ahead, otherwise now, and the result is never earlier
    /// than now.
    pub fn schedule(&mut self, offset: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let base = match self.record.scheduled_at {
            Some(at) if at > now => at,
            _ => now,
        };
        let next = match offset {
            None => base,
            Some(offset) => base
                .checked_add_signed(offset)
                .ok_or_else(|| EngineError::InvalidSchedule(format!("{base} + {offset}")))?
                .max(now),
        };
        self.schedule_at(next)
    }

    /// Set `scheduled_at` to an exact instant and flag the instance as
    /// rescheduled. The instant is truncated to the store's microsecond
    /// precision so memory and row agree.
    pub fn schedule_at(&mut self, at: DateTime<Utc>) -> Result<()> {
        let at = at.trunc_subsecs(6);
        self.record.scheduled_at = Some(at);
        self.pending.scheduled_at = Some(Some(at));
        self.save()?;
        self.rescheduled = true;
        debug!(job_id = self.record.id, scheduled_at = %at, "transaction scheduled");
        Ok(())
    }

    /// Park the transaction: it leaves the runnable pool until rescheduled.
    pub fn unschedule(&mut self) -> Result<()> {
        self.record.scheduled_at = None;
        self.pending.scheduled_at = Some(None);
        self.save()
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// Claim the transaction for one worker.
    ///
    /// Under the global claim lock: re-read the row, refuse if it is already
    /// locked, otherwise persist `locked = true`. The runnable query is not
    /// atomic with the claim; this check-then-set is what prevents two
    /// workers from running the same job.
    pub fn lock(&mut self, owner: &str) -> Result<()> {
        off_runtime(|| self.acquire_claim_lock(owner))?;
        let outcome = self.claim();
        match self.store.release_lock(CLAIM_LOCK, owner) {
            Ok(true) => {}
            Ok(false) => warn!(owner, "claim lock was not held at release"),
            Err(e) => error!(owner, error = %e, "failed to release claim lock"),
        }
        outcome
    }

    fn claim(&mut self) -> Result<()> {
        self.refresh()?;
        if self.record.locked {
            return Err(EngineError::LockClaimLost { id: self.record.id });
        }
        self.record.locked = true;
        self.pending.locked = Some(true);
        self.save()
    }

    fn acquire_claim_lock(&self, owner: &str) -> Result<()> {
        let deadline = Instant::now() + self.claim_timeout;
        loop {
            if self.store.try_acquire_lock(CLAIM_LOCK, owner)? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(EngineError::LockUnavailable {
                    name: CLAIM_LOCK.to_string(),
                });
            }
            std::thread::sleep(CLAIM_RETRY_INTERVAL);
        }
    }

    /// Release the claim after execution, whatever the outcome.
    pub fn unlock(&mut self) -> Result<()> {
        self.record.locked = false;
        self.pending.locked = Some(false);
        self.save()
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    /// Record a failed run: a failed log row, then `failed` and `completed`.
    pub fn mark_failed(
        &mut self,
        output: &str,
        exception: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.append_log(true, output, Some(exception), at)?;

        self.record.failed = true;
        self.record.completed = true;
        self.pending.failed = Some(true);
        self.pending.completed = Some(true);
        self.save()?;

        error!(
            job_id = self.record.id,
            classname = %self.record.classname,
            error = %exception,
            "transaction failed"
        );
        Ok(())
    }

    /// Record a successful run.
    ///
    /// A transaction that rescheduled itself during the run only gets its
    /// log row; otherwise `failed` is cleared, `completed` is set (unless
    /// recurring) and the retry counter is reset.
    pub fn mark_completed(&mut self, output: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        self.append_log(false, output, None, at)?;

        if self.rescheduled {
            return Ok(());
        }

        self.record.failed = false;
        self.pending.failed = Some(false);
        if !self.record.recurring {
            self.record.completed = true;
            self.pending.completed = Some(true);
        }
        self.set_retry_attempt(0);
        self.save()
    }

    pub(crate) fn append_log(
        &self,
        failed: bool,
        output: &str,
        exception: Option<&str>,
        at: Option<DateTime<Utc>>,
    ) -> Result<LogRecord> {
        Ok(self.store.insert_log(&NewLog {
            transaction_id: self.record.id,
            failed,
            output: output.to_string(),
            exception: exception.map(str::to_string),
            created: at,
        })?)
    }

    /// Execution log, chronological; `limit` keeps only the most recent rows.
    pub fn logs(&self, limit: Option<usize>) -> Result<Vec<LogRecord>> {
        Ok(self.store.logs_for(self.record.id, limit)?)
    }

    pub fn last_log(&self) -> Result<Option<LogRecord>> {
        Ok(self.store.last_log_for(self.record.id)?)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Transactions eligible to run now, in dispatch order, at most `limit`.
    pub fn runnable(store: &Store, limit: usize) -> Result<Vec<Self>> {
        Ok(Self::wrap(store, store.get_runnable(Utc::now(), limit)?))
    }

    pub fn count_runnable(store: &Store) -> Result<u64> {
        Ok(store.count_runnable(Utc::now())?)
    }

    pub fn scheduled(store: &Store) -> Result<Vec<Self>> {
        Ok(Self::wrap(store, store.get_scheduled(Utc::now())?))
    }

    pub fn running(store: &Store) -> Result<Vec<Self>> {
        Ok(Self::wrap(store, store.get_running()?))
    }

    pub fn failed_recurring(store: &Store) -> Result<Vec<Self>> {
        Ok(Self::wrap(store, store.get_failed_recurring()?))
    }

    pub fn by_classname(store: &Store, classname: &str, limit: Option<usize>) -> Result<Vec<Self>> {
        Ok(Self::wrap(store, store.get_by_classname(classname, limit)?))
    }

    /// Crash recovery: clear every claim. Only safe under the daemon lock.
    pub fn unlock_all(store: &Store) -> Result<usize> {
        Ok(store.unlock_all()?)
    }

    fn wrap(store: &Store, records: Vec<TransactionRecord>) -> Vec<Self> {
        records
            .into_iter()
            .map(|record| Self::new(store.clone(), record))
            .collect()
    }
}

/// Run a blocking wait without stalling the other tasks of a multi-threaded
/// runtime. The claim-lock wait sleeps in short steps for up to the claim
/// timeout; on a current-thread runtime (or outside tokio) it simply blocks.
fn off_runtime<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
