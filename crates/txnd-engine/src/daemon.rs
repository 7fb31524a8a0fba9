use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use txnd_core::DaemonConfig;
use txnd_store::{Store, TransactionRecord};

use crate::error::{EngineError, Result};
use crate::lockfile::PidLock;
use crate::monitor::Monitor;
use crate::spawn::Spawner;
use crate::transaction::{Transaction, CLAIM_LOCK};
use crate::worker::WorkerSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// Result of one control-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A transaction was claimed and its worker started.
    Dispatched { id: i64, slot: usize },
    NoIdleSlot,
    /// Nothing runnable, or only serial work while a serial job runs.
    NoWork,
    /// Another claimant won the race for this transaction.
    ClaimLost { id: i64 },
    /// The worker could not be started; the claim was released.
    SpawnFailed { id: i64 },
    /// The store could not be queried; retried after a pause.
    StoreUnavailable,
    Stopping,
}

/// The single control loop that claims runnable transactions and hands them
/// to a fixed pool of worker slots.
pub struct Daemon {
    config: DaemonConfig,
    store: Store,
    spawner: Box<dyn Spawner>,
    slots: Vec<WorkerSlot>,
    lock: Option<PidLock>,
    monitor: Monitor,
    stop: CancellationToken,
    state: DaemonState,
    owner: String,
}

impl Daemon {
    /// Take the liveness lock, provision the slots and recover from a crash.
    ///
    /// Fails with `AlreadyRunning` when another daemon holds the lock.
    pub fn new(config: DaemonConfig, store: Store, spawner: Box<dyn Spawner>) -> Result<Self> {
        let lock = PidLock::acquire(&config.pid_file)?;

        // every claim in the store belonged to a previous, dead daemon
        if let Err(e) = recover(&store) {
            if let Err(release_err) = lock.release() {
                warn!(error = %release_err, "failed to release lock after aborted start");
            }
            return Err(e);
        }

        let slots = (0..config.max_processes.max(1)).map(WorkerSlot::new).collect();
        let monitor = Monitor::new(store.clone(), config.monitor_file.as_ref().map(PathBuf::from));
        let owner = format!("txnd-{}", lock.pid());

        info!(
            max_processes = config.max_processes,
            pid_file = %config.pid_file,
            "daemon initialized"
        );
        Ok(Self {
            config,
            store,
            spawner,
            slots,
            lock: Some(lock),
            monitor,
            stop: CancellationToken::new(),
            state: DaemonState::Initializing,
            owner,
        })
    }

    /// Share an externally owned stop token, typically one already wired to
    /// [`crate::shutdown::install_signal_handlers`].
    pub fn with_stop_token(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Cancelling this token makes the loop stop claiming and drain.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Transactions currently held by a running worker.
    pub fn running(&mut self) -> Vec<TransactionRecord> {
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                if slot.is_running() {
                    slot.current().cloned()
                } else {
                    None
                }
            })
            .collect()
    }

    /// One iteration of the control loop.
    ///
    /// Only a liveness failure is returned as an error; everything else is a
    /// [`Tick`] outcome the loop reacts to.
    pub fn tick(&mut self) -> Result<Tick> {
        let stopping = self.stop.is_cancelled();
        self.refresh_lock()?;
        if stopping {
            return Ok(Tick::Stopping);
        }

        let Some(index) = self.idle_slot() else {
            return Ok(Tick::NoIdleSlot);
        };

        let candidates = match Transaction::runnable(&self.store, self.config.max_processes) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "runnable query failed");
                return Ok(Tick::StoreUnavailable);
            }
        };

        let serial_running = self.serial_running();
        let Some(candidate) = candidates
            .into_iter()
            .find(|tx| !serial_running || tx.is_parallel())
        else {
            return Ok(Tick::NoWork);
        };

        let id = candidate.id();
        let candidate =
            candidate.with_claim_timeout(Duration::from_millis(self.config.claim_timeout_ms));
        let slot = &mut self.slots[index];
        match slot.load(candidate, &self.owner) {
            Ok(()) => {}
            Err(e) if e.is_claim_race() => {
                debug!(job_id = id, error = %e, "claim lost, moving on");
                return Ok(Tick::ClaimLost { id });
            }
            Err(e) => {
                warn!(job_id = id, error = %e, "claim failed");
                return Ok(Tick::StoreUnavailable);
            }
        }

        match slot.run(self.spawner.as_ref()) {
            Ok(()) => Ok(Tick::Dispatched { id, slot: index }),
            Err(e) => {
                error!(job_id = id, slot = index, error = %e, "worker cannot be spawned");
                Ok(Tick::SpawnFailed { id })
            }
        }
    }

    /// Run until stopped, then drain.
    ///
    /// A liveness failure stops claiming at once; running workers are still
    /// drained, the lock record is left alone and the error is returned.
    pub async fn run(&mut self) -> Result<()> {
        self.state = DaemonState::Running;
        info!(pid = std::process::id(), "daemon running");
        if let Err(e) = self.monitor.run() {
            warn!(error = %e, "monitor run failed");
        }

        let idle = Duration::from_millis(self.config.idle_sleep_ms);
        let stop = self.stop.clone();
        let outcome = loop {
            match self.tick() {
                Ok(Tick::Stopping) => break Ok(()),
                Ok(Tick::Dispatched { .. } | Tick::ClaimLost { .. }) => {}
                Ok(_) => pause(&stop, idle).await,
                Err(e) => {
                    error!(error = %e, "liveness lock lost, no further claims");
                    break Err(e);
                }
            }
        };

        self.state = DaemonState::Draining;
        self.drain().await;

        if outcome.is_ok() {
            if let Some(lock) = self.lock.take() {
                lock.release()?;
            }
        }
        self.state = DaemonState::Stopped;
        info!("daemon stopped");
        outcome
    }

    fn refresh_lock(&mut self) -> Result<()> {
        let lock = self.lock.as_mut().ok_or_else(|| {
            EngineError::LivenessLockCorrupted("lock already released".to_string())
        })?;
        let interval = Duration::from_secs(self.config.refresh_interval_secs);
        if lock.refresh(interval)? {
            if let Err(e) = self.monitor.run() {
                warn!(error = %e, "monitor run failed");
            }
        }
        Ok(())
    }

    fn idle_slot(&mut self) -> Option<usize> {
        self.slots
            .iter_mut()
            .position(|slot| !slot.is_running())
    }

    fn serial_running(&mut self) -> bool {
        self.slots
            .iter_mut()
            .any(|slot| slot.is_running() && !slot.is_parallel())
    }

    async fn drain(&mut self) {
        let poll = Duration::from_millis(self.config.drain_poll_ms);
        loop {
            let busy = self
                .slots
                .iter_mut()
                .map(|slot| slot.is_running())
                .filter(|running| *running)
                .count();
            if busy == 0 {
                break;
            }
            debug!(busy, "waiting for workers to finish");
            tokio::time::sleep(poll).await;
        }
    }
}

/// Sleep for `duration` unless `stop` fires first.
async fn pause(stop: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = stop.cancelled() => {}
    }
}

fn recover(store: &Store) -> Result<()> {
    let unlocked = Transaction::unlock_all(store)?;
    if unlocked > 0 {
        warn!(count = unlocked, "released claims left by a previous daemon");
    }
    if store.force_release_lock(CLAIM_LOCK)? {
        warn!("released stale claim lock");
    }
    Ok(())
}
