pub mod message;
pub mod task;

pub use message::{Message, MessageKind};
pub use task::{Task, TaskResult, TaskStatus};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WorkerId = String;
pub type TaskId = Uuid;
pub type MessageId = Uuid;

/// Coarse availability as tracked by the registry. This is deliberately
/// simpler than [`LifecycleState`]: the registry only needs to answer
/// "can this worker take a task right now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityState {
    Idle,
    Busy,
    Error,
    Terminated,
}

impl AvailabilityState {
    pub fn as_str(&self) -> &str {
        match self {
            AvailabilityState::Idle => "idle",
            AvailabilityState::Busy => "busy",
            AvailabilityState::Error => "error",
            AvailabilityState::Terminated => "terminated",
        }
    }
}

/// Full lifecycle state of a worker instance, owned by the lifecycle
/// manager. Richer than the registry's [`AvailabilityState`]; the two are
/// reconciled through `AvailabilityState::from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Initializing,
    Ready,
    Busy,
    Idle,
    Error,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated)
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            LifecycleState::Ready | LifecycleState::Busy | LifecycleState::Idle
        )
    }

    /// Whether moving to `to` is a legal lifecycle transition.
    ///
    /// The lifecycle is monotonic: Initializing -> Ready -> Busy/Idle ->
    /// ShuttingDown -> Terminated. Error is reachable from any non-terminal
    /// state; Terminated is reachable only from ShuttingDown or, as forced
    /// cleanup, from Error.
    pub fn can_transition(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, to) {
            (Initializing, Ready) => true,
            (Ready, Busy) | (Ready, Idle) => true,
            (Busy, Idle) | (Idle, Busy) => true,
            (Ready | Busy | Idle, ShuttingDown) => true,
            (from, Error) => !from.is_terminal() && from != Error,
            (ShuttingDown, Terminated) | (Error, Terminated) => true,
            (Error, ShuttingDown) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Busy => "busy",
            LifecycleState::Idle => "idle",
            LifecycleState::Error => "error",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Terminated => "terminated",
        }
    }
}

impl From<LifecycleState> for AvailabilityState {
    fn from(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Initializing | LifecycleState::Ready | LifecycleState::Idle => {
                AvailabilityState::Idle
            }
            LifecycleState::Busy => AvailabilityState::Busy,
            LifecycleState::Error => AvailabilityState::Error,
            LifecycleState::ShuttingDown | LifecycleState::Terminated => {
                AvailabilityState::Terminated
            }
        }
    }
}
