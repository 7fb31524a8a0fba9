use tracing::{error, info};
use txnd_store::TransactionRecord;

use crate::error::{EngineError, Result};
use crate::spawn::{Spawner, WorkerHandle};
use crate::transaction::Transaction;

/// One of the daemon's `max_processes` execution slots.
///
/// A slot is idle, loaded (claimed transaction, not started yet) or running.
/// The owned [`Transaction`] keeps its claim until the worker releases it.
pub struct WorkerSlot {
    index: usize,
    transaction: Option<Transaction>,
    handle: Option<Box<dyn WorkerHandle>>,
    parallel: bool,
}

impl WorkerSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            transaction: None,
            handle: None,
            parallel: true,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Claim `transaction` for this slot.
    pub fn load(&mut self, mut transaction: Transaction, owner: &str) -> Result<()> {
        transaction.lock(owner)?;
        self.parallel = transaction.is_parallel();
        self.transaction = Some(transaction);
        Ok(())
    }

    /// Polls the worker and frees the slot once it has exited.
    pub fn is_running(&mut self) -> bool {
        let finished = match self.handle.as_mut() {
            Some(handle) => handle.try_finished(),
            None => return false,
        };
        if finished {
            if let Some(tx) = &self.transaction {
                info!(slot = self.index, job_id = tx.id(), "worker finished");
            }
            self.reset();
        }
        !finished
    }

    /// Parallel flag of the running transaction (stale once idle).
    pub fn is_parallel(&mut self) -> bool {
        self.is_running();
        self.parallel
    }

    /// Start the loaded transaction.
    ///
    /// On spawn failure the claim is released and the slot reset, so the
    /// transaction becomes runnable again.
    pub fn run(&mut self, spawner: &dyn Spawner) -> Result<()> {
        let Some(transaction) = self.transaction.as_mut() else {
            return Err(EngineError::SpawnFailure(format!(
                "slot {} has no transaction loaded",
                self.index
            )));
        };

        match spawner.spawn(transaction.record()) {
            Ok(handle) => {
                info!(
                    slot = self.index,
                    job_id = transaction.id(),
                    classname = %transaction.classname(),
                    worker = %handle.label(),
                    "worker started"
                );
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                if let Err(unlock_err) = transaction.unlock() {
                    error!(job_id = transaction.id(), error = %unlock_err, "failed to release claim");
                }
                self.reset();
                Err(match e {
                    EngineError::SpawnFailure(_) => e,
                    other => EngineError::SpawnFailure(other.to_string()),
                })
            }
        }
    }

    /// Forward a stop request to the running worker, if any.
    pub fn signal(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            handle.signal();
        }
    }

    /// The transaction occupying this slot.
    pub fn current(&self) -> Option<&TransactionRecord> {
        self.transaction.as_ref().map(Transaction::record)
    }

    fn reset(&mut self) {
        self.transaction = None;
        self.handle = None;
        self.parallel = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use txnd_store::{NewTransaction, Store};

    struct Flag(Arc<AtomicBool>);

    impl WorkerHandle for Flag {
        fn try_finished(&mut self) -> bool {
            self.0.load(Ordering::SeqCst)
        }

        fn signal(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }

        fn label(&self) -> String {
            "flag".into()
        }
    }

    struct FlagSpawner(Arc<AtomicBool>);

    impl Spawner for FlagSpawner {
        fn spawn(&self, _: &TransactionRecord) -> Result<Box<dyn WorkerHandle>> {
            Ok(Box::new(Flag(Arc::clone(&self.0))))
        }
    }

    struct Refuses;

    impl Spawner for Refuses {
        fn spawn(&self, _: &TransactionRecord) -> Result<Box<dyn WorkerHandle>> {
            Err(EngineError::SpawnFailure("fork: resource unavailable".into()))
        }
    }

    fn serial(store: &Store) -> Transaction {
        let mut new = NewTransaction::new("serial");
        new.parallel = false;
        Transaction::new(store.clone(), store.insert(&new).unwrap())
    }

    #[test]
    fn slot_lifecycle_follows_worker() {
        let store = Store::open_in_memory().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let mut slot = WorkerSlot::new(0);
        assert!(!slot.is_running());

        let tx = serial(&store);
        let id = tx.id();
        slot.load(tx, "test").unwrap();
        assert!(store.get(id).unwrap().locked);

        slot.run(&FlagSpawner(Arc::clone(&done))).unwrap();
        assert!(slot.is_running());
        assert!(!slot.is_parallel());
        assert_eq!(slot.current().map(|r| r.id), Some(id));

        slot.signal();
        assert!(!slot.is_running());
        assert!(slot.current().is_none());
    }

    #[test]
    fn spawn_failure_releases_claim() {
        let store = Store::open_in_memory().unwrap();
        let mut slot = WorkerSlot::new(3);
        let tx = serial(&store);
        let id = tx.id();
        slot.load(tx, "test").unwrap();

        let err = slot.run(&Refuses).unwrap_err();
        assert!(matches!(err, EngineError::SpawnFailure(_)));
        assert!(!store.get(id).unwrap().locked);
        assert!(!slot.is_running());
        assert!(slot.current().is_none());
    }

    #[test]
    fn run_without_load_is_an_error() {
        let mut slot = WorkerSlot::new(1);
        assert!(slot.run(&Refuses).is_err());
    }
}
