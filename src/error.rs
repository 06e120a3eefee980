use thiserror::Error;

use crate::types::{LifecycleState, WorkerId};

/// Usage errors surfaced synchronously by the orchestration core.
///
/// Expected negative outcomes (no eligible worker, full mailbox, timeout,
/// cancel of a non-pending task) are reported through `bool`/`Option`
/// returns instead, never through this type.
#[derive(Debug, Error)]
pub enum ForemanError {
    #[error("worker {0} already registered")]
    WorkerAlreadyRegistered(WorkerId),

    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("unknown worker type: {0}")]
    UnknownWorkerType(String),

    #[error("worker {0} already spawned")]
    WorkerAlreadySpawned(WorkerId),

    #[error("invalid lifecycle transition for {worker}: {from:?} -> {to:?}")]
    InvalidTransition {
        worker: WorkerId,
        from: LifecycleState,
        to: LifecycleState,
    },
}
