use thiserror::Error;

use crate::core::state::WorkState;
use crate::core::store::StoreError;

/// Errors surfaced by the public work manager API.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The buffered-item ceiling has been reached; nothing was enqueued.
    #[error("buffered item limit reached ({limit})")]
    Capacity { limit: usize },

    /// `post` was called while the manager is not in the `Working` state.
    #[error("work manager is not accepting work (state: {0})")]
    NotWorking(WorkState),

    /// A control operation was invoked outside its legal lifecycle state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: WorkState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    /// A handler failed without asking for a retry.
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
}

/// Record of a worker that terminated on a fatal error.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub worker: u64,
    pub queue: Option<String>,
    pub error: String,
}
