use serde::Serialize;
use thiserror::Error;

/// One teardown step that did not converge, reported by the cleanup planner.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub step: &'static str,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: &'static str,
    },

    #[error("upload of {size} bytes exceeds usable image capacity of {capacity} bytes")]
    CapacityExceeded { size: u64, capacity: u64 },

    #[error("hypervisor API {method} {path}: {detail}")]
    Protocol {
        method: &'static str,
        path: String,
        detail: String,
    },

    #[error("hypervisor did not respond: {0}")]
    SupervisorTimeout(String),

    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: &'static str, detail: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("cleanup completed with {} failed steps", .0.len())]
    PartialCleanup(Vec<CleanupFailure>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
