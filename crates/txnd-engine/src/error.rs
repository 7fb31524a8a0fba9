use thiserror::Error;

/// Errors raised by the scheduling and execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The exclusivity lock record already exists.
    #[error("transaction daemon already running (lock record {path})")]
    AlreadyRunning { path: String },

    /// No lock record: there is no daemon to stop or query.
    #[error("transaction daemon is not running")]
    NotRunning,

    /// Another worker claimed the transaction between query and claim.
    #[error("transaction {id} is already locked")]
    LockClaimLost { id: i64 },

    /// The claim lock could not be obtained within the configured wait.
    #[error("could not obtain lock {name}")]
    LockUnavailable { name: String },

    /// The OS refused to create a worker.
    #[error("worker cannot be spawned: {0}")]
    SpawnFailure(String),

    /// The lock record vanished or names another owner.
    #[error("problem with lock: {0}")]
    LivenessLockCorrupted(String),

    /// The retry policy gave up; carries the output of the last attempt.
    #[error("transaction {id} gave up after {attempts} attempts: {output}")]
    RetriesExhausted {
        id: i64,
        attempts: u32,
        output: String,
    },

    /// The requested schedule cannot be represented.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// No job implementation is registered under this classname.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] txnd_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Claim failures the control loop recovers from by moving on.
    pub fn is_claim_race(&self) -> bool {
        matches!(
            self,
            EngineError::LockClaimLost { .. } | EngineError::LockUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
