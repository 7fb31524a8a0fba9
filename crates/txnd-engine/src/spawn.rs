//! Worker spawning.
//!
//! A [`Spawner`] starts one isolated execution of a claimed transaction and
//! hands back a [`WorkerHandle`] the daemon polls without blocking. The worker
//! receives nothing but the transaction id; it reloads everything else from
//! the store.
//!
//! Two implementations:
//!
//! | Spawner          | Isolation                      | Poll            | Signal       |
//! |------------------|--------------------------------|-----------------|--------------|
//! | `ProcessSpawner` | child process, own session     | `try_wait`      | `SIGTERM`    |
//! | `TaskSpawner`    | tokio task, panics contained   | `is_finished`   | `abort`      |

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use txnd_store::{Store, TransactionRecord};

use crate::error::{EngineError, Result};
use crate::job::Registry;
use crate::runner;

/// A running worker owned by one slot.
pub trait WorkerHandle: Send {
    /// Non-blocking: true once the worker has exited. Reaps it if needed.
    fn try_finished(&mut self) -> bool;

    /// Ask the worker to stop.
    fn signal(&mut self);

    /// Printable identity for logs (pid or task label).
    fn label(&self) -> String;
}

/// Starts workers for claimed transactions.
pub trait Spawner: Send + Sync {
    fn spawn(&self, transaction: &TransactionRecord) -> Result<Box<dyn WorkerHandle>>;
}

/// Title shown in process listings for a worker.
pub fn worker_title(transaction: &TransactionRecord) -> String {
    let mode = if transaction.parallel { "parallel" } else { "serial" };
    format!(
        "txnd: {} ({}) - {mode}",
        transaction.classname, transaction.id
    )
}

// ---------------------------------------------------------------------------
// Process workers
// ---------------------------------------------------------------------------

/// Runs `<program> <args..> worker --id <id>` as a detached child.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The currently running executable.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Arguments placed before the `worker` subcommand (e.g. `--config`).
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, transaction: &TransactionRecord) -> Result<Box<dyn WorkerHandle>> {
        use std::os::unix::process::CommandExt;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("worker")
            .arg("--id")
            .arg(transaction.id.to_string())
            .arg0(worker_title(transaction))
            .stdin(Stdio::null());
        // own session: terminal signals aimed at the daemon do not reach jobs.
        // Safety: setsid is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = cmd
            .spawn()
            .map_err(|e| EngineError::SpawnFailure(format!("spawn failed: {e}")))?;

        debug!(job_id = transaction.id, pid = child.id(), "worker process started");
        Ok(Box::new(ProcessHandle {
            child,
            job_id: transaction.id,
        }))
    }
}

struct ProcessHandle {
    child: Child,
    job_id: i64,
}

impl WorkerHandle for ProcessHandle {
    fn try_finished(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(job_id = self.job_id, pid = self.child.id(), %status, "worker exited abnormally");
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                // the child is gone from our point of view
                error!(job_id = self.job_id, error = %e, "cannot poll worker");
                true
            }
        }
    }

    fn signal(&mut self) {
        // Safety: the pid belongs to our own unreaped child.
        let rc = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                job_id = self.job_id,
                error = %std::io::Error::last_os_error(),
                "failed to signal worker"
            );
        }
    }

    fn label(&self) -> String {
        format!("pid {}", self.child.id())
    }
}

// ---------------------------------------------------------------------------
// Task workers
// ---------------------------------------------------------------------------

/// Runs each transaction on the current tokio runtime.
pub struct TaskSpawner {
    store: Store,
    registry: Arc<Registry>,
}

impl TaskSpawner {
    pub fn new(store: Store, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }
}

impl Spawner for TaskSpawner {
    fn spawn(&self, transaction: &TransactionRecord) -> Result<Box<dyn WorkerHandle>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::SpawnFailure(format!("no runtime: {e}")))?;

        let store = self.store.clone();
        let registry = Arc::clone(&self.registry);
        let id = transaction.id;
        let handle = runtime.spawn(async move {
            if let Err(e) = runner::execute(&store, &registry, id).await {
                error!(job_id = id, error = %e, "worker task failed");
            }
        });

        Ok(Box::new(TaskHandle { handle, job_id: id }))
    }
}

struct TaskHandle {
    handle: JoinHandle<()>,
    job_id: i64,
}

impl WorkerHandle for TaskHandle {
    fn try_finished(&mut self) -> bool {
        self.handle.is_finished()
    }

    fn signal(&mut self) {
        self.handle.abort();
    }

    fn label(&self) -> String {
        format!("task {}", self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Enqueue, Job, JobContext};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Quick;

    #[async_trait]
    impl Job for Quick {
        async fn run(&self, _ctx: &mut JobContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn title_names_class_id_and_mode() {
        let store = Store::open_in_memory().unwrap();
        let mut new = txnd_store::NewTransaction::new("report");
        new.parallel = false;
        let rec = store.insert(&new).unwrap();
        assert_eq!(worker_title(&rec), format!("txnd: report ({}) - serial", rec.id));
    }

    #[tokio::test]
    async fn task_worker_runs_claimed_transaction() {
        let store = Store::open_in_memory().unwrap();
        let mut registry = Registry::new();
        registry.register("quick", Quick);
        let registry = Arc::new(registry);

        let mut tx = registry.enqueue(&store, "quick", Enqueue::now()).unwrap();
        tx.lock("test").unwrap();

        let spawner = TaskSpawner::new(store.clone(), Arc::clone(&registry));
        let mut handle = spawner.spawn(tx.record()).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !handle.try_finished() {
            assert!(tokio::time::Instant::now() < deadline, "worker did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let rec = store.get(tx.id()).unwrap();
        assert!(rec.completed);
        assert!(!rec.locked);
    }

    #[test]
    fn task_spawner_outside_runtime_fails_cleanly() {
        let store = Store::open_in_memory().unwrap();
        let rec = store.insert(&txnd_store::NewTransaction::new("quick")).unwrap();
        let spawner = TaskSpawner::new(store, Arc::new(Registry::new()));
        assert!(matches!(
            spawner.spawn(&rec),
            Err(EngineError::SpawnFailure(_))
        ));
    }

    #[test]
    fn process_spawner_reports_missing_program() {
        let store = Store::open_in_memory().unwrap();
        let rec = store.insert(&txnd_store::NewTransaction::new("quick")).unwrap();
        let spawner = ProcessSpawner::new("/nonexistent/txnd-worker");
        assert!(matches!(
            spawner.spawn(&rec),
            Err(EngineError::SpawnFailure(_))
        ));
    }

    #[test]
    fn process_worker_leads_its_own_session() {
        let store = Store::open_in_memory().unwrap();
        let rec = store.insert(&txnd_store::NewTransaction::new("quick")).unwrap();
        let spawner = ProcessSpawner::new("sh").with_args(vec!["-c".into(), "sleep 30".into()]);
        let mut handle = spawner.spawn(&rec).unwrap();

        let pid: libc::pid_t = handle
            .label()
            .trim_start_matches("pid ")
            .parse()
            .unwrap();
        // Safety: plain queries on our own child.
        let (sid, pgid, own_sid) =
            unsafe { (libc::getsid(pid), libc::getpgid(pid), libc::getsid(0)) };
        handle.signal();

        assert_eq!(sid, pid);
        assert_eq!(pgid, pid);
        assert_ne!(sid, own_sid);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.try_finished() {
            assert!(std::time::Instant::now() < deadline, "worker ignored SIGTERM");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn process_handle_polls_and_signals() {
        let store = Store::open_in_memory().unwrap();
        let rec = store.insert(&txnd_store::NewTransaction::new("quick")).unwrap();
        // runs `sh -c 'sleep 30' worker --id N`
        let spawner = ProcessSpawner::new("sh").with_args(vec!["-c".into(), "sleep 30".into()]);
        let mut handle = spawner.spawn(&rec).unwrap();
        assert!(!handle.try_finished());
        handle.signal();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.try_finished() {
            assert!(std::time::Instant::now() < deadline, "worker ignored SIGTERM");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
