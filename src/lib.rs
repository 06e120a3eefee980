pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod types;
pub mod worker;

pub use bus::CommunicationBus;
pub use config::{BusConfig, CoordinatorConfig, LifecycleConfig, OrchestratorConfig};
pub use coordinator::Coordinator;
pub use error::ForemanError;
pub use lifecycle::{LifecycleManager, SpawnSpec, WorkerFactory};
pub use orchestrator::{Orchestrator, PipelineReport};
pub use registry::Registry;
pub use types::*;
pub use worker::{Capability, StatusHandle, Worker, WorkerStatus};
