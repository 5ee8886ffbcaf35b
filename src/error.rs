use thiserror::Error;

/// Result alias used across the crate.
pub type FluidResult<T> = Result<T, FluidError>;

// MARK: Error Types
#[derive(Debug, Error)]
pub enum FluidError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Work was submitted to a pool after `WorkerPool::shutdown`.
    #[error("worker pool has been shut down, cannot run `{phase}`")]
    PoolShutDown { phase: &'static str },

    /// The pool was shut down while a phase was in flight. Ranges that had
    /// not started were skipped and the simulation state was not swapped.
    #[error("phase `{phase}` aborted: {skipped} of {total} work ranges were not processed")]
    PhaseAborted {
        phase: &'static str,
        skipped: usize,
        total: usize,
    },

    #[error("failed to start worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// A spatial index was requested before one was built.
    #[error("spatial index has not been built yet")]
    TreeNotBuilt,

    #[error("length mismatch for {name}: expected {expected}, got {actual}")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FluidError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        FluidError::InvalidConfig(message.into())
    }
}
