use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::pool::PoolState;

/// Errors returned by [`SharedQueue`](crate::queue::SharedQueue) operations.
///
/// `Empty` and `Full` are expected outcomes of every get/put call, not faults.
/// A failed put hands the rejected item back in `Full` so the caller can retry.
#[derive(Error)]
pub enum QueueError<T> {
    #[error("Queue is empty")]
    Empty,
    #[error("Queue is full")]
    Full(T),
    #[error("Queue is disconnected")]
    Disconnected,
    #[error("Queue item could not cross the instance link: {0}")]
    Codec(String),
}

// Manual impl so items do not need to be `Debug`.
impl<T> fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Empty => f.write_str("Empty"),
            QueueError::Full(_) => f.write_str("Full(..)"),
            QueueError::Disconnected => f.write_str("Disconnected"),
            QueueError::Codec(message) => write!(f, "Codec({message:?})"),
        }
    }
}

impl<T> PartialEq for QueueError<T> {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }
}

impl<T> QueueError<T> {
    pub fn kind(&self) -> QueueErrorKind {
        match self {
            QueueError::Empty => QueueErrorKind::Empty,
            QueueError::Full(_) => QueueErrorKind::Full,
            QueueError::Disconnected => QueueErrorKind::Disconnected,
            QueueError::Codec(_) => QueueErrorKind::Codec,
        }
    }

    /// Recover the item a failed put was carrying.
    pub fn into_inner(self) -> Option<T> {
        match self {
            QueueError::Full(item) => Some(item),
            _ => None,
        }
    }
}

/// Item-free form of [`QueueError`], used where the payload has been dropped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueErrorKind {
    #[error("empty")]
    Empty,
    #[error("full")]
    Full,
    #[error("disconnected")]
    Disconnected,
    #[error("codec failure")]
    Codec,
}

/// Errors raised while building a [`WorkerSpec`](crate::spec::WorkerSpec).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Worker count must be at least 1 (got {0})")]
    ZeroCount(usize),
    #[error("Worker '{0}' has no entry computation")]
    MissingEntry(String),
    #[error("Worker '{0}' has no exit signal")]
    MissingExitSignal(String),
    #[error("Worker role name must not be empty")]
    EmptyName,
    #[error("Worker '{0}' poll timeout must be greater than 0")]
    ZeroPollTimeout(String),
}

/// Errors related to [`WorkerPool`](crate::pool::WorkerPool) lifecycle.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid worker spec: {0}")]
    InvalidSpec(#[from] SpecError),
    #[error("Cannot {operation} pool '{name}' in state {state:?}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: PoolState,
    },
    #[error("Failed to spawn instance {index} of '{name}': {source}")]
    Spawn {
        name: String,
        index: usize,
        #[source]
        source: std::io::Error,
    },
}

/// An instance process that did not exit cleanly: it panicked, exited with
/// a non-zero status, or was killed by a signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Instance {index} of '{role}' (pid {pid}) crashed: {message}")]
pub struct InstanceCrash {
    pub role: String,
    pub index: usize,
    pub pid: i32,
    pub message: String,
}

/// Recoverable per-iteration failures inside a worker loop.
///
/// The loop drivers in [`worker`](crate::worker) log these and keep looping.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Queue {0}")]
    Queue(QueueErrorKind),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Malformed data: {0}")]
    MalformedData(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl<T> From<QueueError<T>> for WorkerError {
    fn from(err: QueueError<T>) -> Self {
        WorkerError::Queue(err.kind())
    }
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors related to the [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Orchestrator already started")]
    AlreadyStarted,
    #[error("Orchestrator has not been started")]
    NotStarted,
    #[error("Pool '{0}' is still running")]
    StillRunning(String),
    #[error("Orchestrator error: {0}")]
    Other(#[from] anyhow::Error),
}
