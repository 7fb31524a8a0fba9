//! Retry policy: fixed-delay and polynomial backoff.
//!
//! A retry records the failed attempt in the log, bumps `retry_attempt` and
//! reschedules from now. Once `max_attempts` is reached the policy gives up
//! with [`EngineError::RetriesExhausted`] and leaves the row untouched; the
//! runner then marks it failed with that error.

use chrono::{Duration, Utc};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::transaction::Transaction;

/// Delay used by [`Transaction::retry`] when none is given.
pub const DEFAULT_RETRY_DELAY_SECS: i64 = 15 * 60;

/// Ceiling for a computed backoff delay.
pub const MAX_BACKOFF_SECS: i64 = 365 * 24 * 60 * 60;

/// Unit multiplied by `attempt ^ exponent` in incremental backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffUnit {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
}

impl BackoffUnit {
    fn seconds(self) -> i64 {
        match self {
            BackoffUnit::Seconds => 1,
            BackoffUnit::Minutes => 60,
            BackoffUnit::Hours => 3_600,
            BackoffUnit::Days => 86_400,
        }
    }
}

/// `attempt ^ exponent` units, saturating at [`MAX_BACKOFF_SECS`].
pub fn backoff_delay(attempt: u32, exponent: u32, unit: BackoffUnit) -> Duration {
    let units = i64::from(attempt).checked_pow(exponent).unwrap_or(i64::MAX);
    let secs = units.saturating_mul(unit.seconds()).min(MAX_BACKOFF_SECS);
    Duration::seconds(secs)
}

impl Transaction {
    /// Log the failed attempt and try again after `delay` (15 minutes by
    /// default).
    pub fn retry(&mut self, output: &str, delay: Option<Duration>) -> Result<()> {
        self.ensure_attempts_left(output)?;
        let delay = delay
            .unwrap_or_else(|| Duration::seconds(DEFAULT_RETRY_DELAY_SECS))
            .max(Duration::zero());
        self.reschedule_after_failure(output, delay)
    }

    /// Like [`retry`](Self::retry) with a delay of `attempt ^ exponent`
    /// units, where `attempt` is the attempt count including this retry
    /// (1, 4, 9, 16 minutes with the defaults).
    pub fn retry_incremental(
        &mut self,
        output: &str,
        exponent: u32,
        unit: BackoffUnit,
    ) -> Result<()> {
        self.ensure_attempts_left(output)?;
        let delay = backoff_delay(self.retry_attempt().saturating_add(1), exponent, unit);
        self.reschedule_after_failure(output, delay)
    }

    fn ensure_attempts_left(&self, output: &str) -> Result<()> {
        let attempts = self.retry_attempt();
        match self.max_attempts() {
            Some(max) if max > 0 && attempts >= max => Err(EngineError::RetriesExhausted {
                id: self.id(),
                attempts,
                output: output.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn reschedule_after_failure(&mut self, output: &str, delay: Duration) -> Result<()> {
        self.append_log(true, output, None, None)?;
        let attempt = self.retry_attempt().saturating_add(1);
        self.set_retry_attempt(attempt);
        let at = Utc::now() + delay;
        self.schedule_at(at)?;
        warn!(
            job_id = self.id(),
            classname = %self.classname(),
            attempt,
            retry_at = %at,
            "transaction will be retried"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use txnd_store::{NewTransaction, Store};

    fn transaction(store: &Store, max_attempts: Option<u32>) -> Transaction {
        let record = store.insert(&NewTransaction::new("flaky")).unwrap();
        Transaction::new(store.clone(), record).with_max_attempts(max_attempts)
    }

    #[test]
    fn backoff_grows_polynomially() {
        assert_eq!(backoff_delay(0, 2, BackoffUnit::Minutes), Duration::zero());
        assert_eq!(backoff_delay(1, 2, BackoffUnit::Minutes), Duration::minutes(1));
        assert_eq!(backoff_delay(3, 2, BackoffUnit::Minutes), Duration::minutes(9));
        assert_eq!(backoff_delay(2, 3, BackoffUnit::Seconds), Duration::seconds(8));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let capped = Duration::seconds(MAX_BACKOFF_SECS);
        assert_eq!(backoff_delay(u32::MAX, 10, BackoffUnit::Days), capped);
        assert_eq!(backoff_delay(1_000, 2, BackoffUnit::Days), capped);
    }

    #[test]
    fn retry_defaults_to_fifteen_minutes() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = transaction(&store, None);
        let before = Utc::now();
        tx.retry("nope", None).unwrap();

        let rec = store.get(tx.id()).unwrap();
        assert_eq!(rec.retry_attempt, 1);
        let at = rec.scheduled_at.unwrap();
        assert!(at >= before + Duration::minutes(15));
        assert!(at <= Utc::now() + Duration::minutes(15));
        assert!(tx.is_rescheduled());

        let logs = tx.logs(None).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].failed);
        assert_eq!(logs[0].output, "nope");
    }

    #[test]
    fn retry_incremental_uses_incremented_attempt() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = transaction(&store, None);
        tx.set_retry_attempt(3);
        tx.save().unwrap();

        let before = Utc::now();
        tx.retry_incremental("x", 2, BackoffUnit::Minutes).unwrap();
        let rec = store.get(tx.id()).unwrap();
        assert_eq!(rec.retry_attempt, 4);
        let at = rec.scheduled_at.unwrap();
        assert!(at >= before + Duration::minutes(16));
        assert!(at <= Utc::now() + Duration::minutes(16));
    }

    #[test]
    fn successive_incremental_delays_never_shrink() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = transaction(&store, None);

        let mut previous = Duration::zero();
        for attempt in 1..=6i64 {
            let before = Utc::now();
            tx.retry_incremental("still down", 2, BackoffUnit::Seconds).unwrap();
            let after = Utc::now();
            let at = store.get(tx.id()).unwrap().scheduled_at.unwrap();

            let expected = Duration::seconds(attempt * attempt);
            assert!(at >= before.trunc_subsecs(6) + expected);
            assert!(at <= after + expected);
            let delay = at - before;
            assert!(delay >= previous, "attempt {attempt}: {delay} < {previous}");
            previous = delay;
        }
        assert_eq!(tx.retry_attempt(), 6);
    }

    #[test]
    fn backoff_is_monotonic_through_the_ceiling() {
        for unit in [BackoffUnit::Seconds, BackoffUnit::Days] {
            let delays: Vec<Duration> = (0..2_000).map(|n| backoff_delay(n, 3, unit)).collect();
            assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn retry_gives_up_at_max_attempts() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = transaction(&store, Some(2));
        tx.retry("one", None).unwrap();
        tx.retry("two", None).unwrap();

        let err = tx.retry("three", None).unwrap_err();
        match err {
            EngineError::RetriesExhausted {
                attempts, output, ..
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(output, "three");
            }
            other => panic!("unexpected error: {other}"),
        }
        // the refused retry leaves no trace
        assert_eq!(store.get(tx.id()).unwrap().retry_attempt, 2);
        assert_eq!(tx.logs(None).unwrap().len(), 2);
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = transaction(&store, Some(0));
        for _ in 0..5 {
            tx.retry("again", Some(Duration::seconds(1))).unwrap();
        }
        assert_eq!(tx.retry_attempt(), 5);
    }

    #[test]
    fn success_after_retry_keeps_the_row_open() {
        let store = Store::open_in_memory().unwrap();
        let mut tx = transaction(&store, None);
        tx.retry("first try failed", None).unwrap();
        tx.mark_completed("", None).unwrap();

        // rescheduled during this run, so completion does not seal it
        let rec = store.get(tx.id()).unwrap();
        assert!(!rec.completed);
        assert_eq!(rec.retry_attempt, 1);
    }
}
