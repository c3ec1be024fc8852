use thiserror::Error;

use crate::storage::StorageType;

/// Errors raised by the scan scheduler and recorded on scan tasks.
///
/// Values are cloneable so the same failure can be stored on a task's
/// status and returned to the submitter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// A pool or token refused the task. Surfaced to users as a capacity
    /// problem rather than a data problem.
    #[error("Failed to submit scanner to scanner pool reason:{reason}|type:{storage}")]
    TooManyTasks { reason: String, storage: StorageType },

    #[error("{pool} queue is full (capacity {capacity})")]
    QueueFull { pool: String, capacity: usize },

    #[error("{pool} is shut down")]
    PoolShutdown { pool: String },

    #[error("failed to spawn worker thread for {pool}: {reason}")]
    ThreadSpawn { pool: String, reason: String },

    #[error("scanner scheduler is already initialized")]
    AlreadyInitialized,

    #[error("scanner scheduler is not initialized")]
    NotInitialized,

    #[error("scanner error: {0}")]
    Scanner(String),

    #[error("block merge failed: {0}")]
    BlockMerge(String),

    #[error("scan worker panicked: {0}")]
    Panicked(String),
}

impl ScanError {
    /// Whether this error is the scheduler's backpressure signal.
    pub fn is_too_many_tasks(&self) -> bool {
        matches!(self, ScanError::TooManyTasks { .. })
    }

    /// Build a [`ScanError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        ScanError::Panicked(msg)
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
