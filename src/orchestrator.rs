use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::bus::{BusStats, CommunicationBus};
use crate::config::OrchestratorConfig;
use crate::coordinator::{Coordinator, CoordinatorStats};
use crate::lifecycle::{LifecycleManager, LifecycleStats, SpawnSpec, WorkerFactory};
use crate::registry::{Registry, RegistryStats};
use crate::types::{Task, TaskId, TaskResult, TaskStatus, WorkerId};
use crate::worker::Worker;

const PUMP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub task_ids: Vec<TaskId>,
    pub results: HashMap<TaskId, TaskResult>,
    pub completed: usize,
    pub failed: usize,
    pub unfinished: usize,
    pub duration: Duration,
}

impl PipelineReport {
    pub fn all_completed(&self) -> bool {
        self.completed == self.task_ids.len()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub registry: RegistryStats,
    pub bus: BusStats,
    pub coordinator: CoordinatorStats,
    pub lifecycle: LifecycleStats,
}

/// Facade wiring the registry, bus, coordinator and lifecycle manager
/// into one runtime. Also drives the message pump that delivers inbound
/// mail to each worker's `handle_message`.
pub struct Orchestrator {
    registry: Arc<Registry>,
    bus: Arc<CommunicationBus>,
    coordinator: Arc<Coordinator>,
    lifecycle: Arc<LifecycleManager>,
    running: AtomicBool,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(CommunicationBus::new(config.bus));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            bus.clone(),
            config.coordinator,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            registry.clone(),
            bus.clone(),
            config.lifecycle,
        ));
        Arc::new(Self {
            registry,
            bus,
            coordinator,
            lifecycle,
            running: AtomicBool::new(false),
            pump_handle: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<CommunicationBus> {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.start_relay();
        self.coordinator.start();
        self.lifecycle.start_monitoring();

        let orchestrator = self.clone();
        let handle = tokio::spawn(async move {
            while orchestrator.running.load(Ordering::SeqCst) {
                orchestrator.pump_pass().await;
                sleep(PUMP_INTERVAL).await;
            }
        });
        *self.pump_handle.lock().unwrap() = Some(handle);
        log::info!("orchestrator started");
    }

    /// Stop all loops and gracefully terminate every worker.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.pump_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.coordinator.stop().await;
        self.lifecycle.stop_monitoring().await;
        let terminated = self.lifecycle.terminate_all(true).await;
        self.bus.stop_relay().await;
        log::info!("orchestrator stopped, {terminated} workers shut down cleanly");
    }

    /// One pump iteration: hand every queued inbound message to its
    /// worker. Handling runs on its own tokio task so a slow `execute`
    /// never stalls heartbeats or other workers.
    async fn pump_pass(&self) {
        let workers: Vec<Arc<dyn Worker>> = self
            .registry
            .list(None, None, None)
            .iter()
            .filter_map(|meta| self.registry.get(&meta.worker_id))
            .collect();

        for worker in workers {
            while let Some(message) = self.bus.try_get(worker.id()) {
                let worker = worker.clone();
                let bus = self.bus.clone();
                tokio::spawn(async move {
                    if let Some(reply) = worker.handle_message(message).await {
                        bus.send(reply).await;
                    }
                });
            }
        }
    }

    /// Register a pre-built worker, bypassing the factory path.
    pub fn register_worker(
        &self,
        worker: Arc<dyn Worker>,
        worker_type: &str,
        tags: Vec<String>,
    ) -> Result<()> {
        let worker_id = worker.id().to_string();
        self.registry.register(worker, worker_type, tags)?;
        self.bus.register(&worker_id);
        Ok(())
    }

    pub fn register_type(&self, worker_type: &str, factory: WorkerFactory) {
        self.lifecycle.register_type(worker_type, factory);
    }

    pub async fn spawn(&self, spec: SpawnSpec) -> Result<WorkerId> {
        self.lifecycle.spawn(spec).await
    }

    pub async fn terminate(&self, worker_id: &str, graceful: bool) -> Result<()> {
        self.lifecycle.terminate(worker_id, graceful).await
    }

    pub fn submit(&self, task: Task) -> TaskId {
        self.coordinator.submit(task)
    }

    pub async fn wait_for(&self, task_id: TaskId, timeout: Duration) -> Option<TaskResult> {
        self.coordinator.wait_for(task_id, timeout).await
    }

    pub async fn run_pipeline(&self, tasks: Vec<Task>, timeout: Duration) -> PipelineReport {
        let started = Instant::now();
        let task_ids = self.coordinator.submit_many(tasks);
        let results = self.coordinator.wait_for_many(&task_ids, timeout).await;

        let completed = results
            .values()
            .filter(|r| r.status == TaskStatus::Completed)
            .count();
        let failed = results
            .values()
            .filter(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .count();
        let unfinished = task_ids.len() - results.len();

        PipelineReport {
            task_ids,
            results,
            completed,
            failed,
            unfinished,
            duration: started.elapsed(),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            registry: self.registry.stats(),
            bus: self.bus.stats(),
            coordinator: self.coordinator.stats(),
            lifecycle: self.lifecycle.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Capability, StatusHandle};
    use async_trait::async_trait;
    use futures::FutureExt;
    use serde_json::{json, Value};

    struct EchoWorker {
        id: String,
        capabilities: Vec<Capability>,
        status: StatusHandle,
    }

    impl EchoWorker {
        fn new(id: &str) -> Arc<Self> {
            let capabilities = vec![Capability::new("echo", "Echoes its payload")];
            Arc::new(Self {
                id: id.to_string(),
                status: StatusHandle::new(id, &capabilities),
                capabilities,
            })
        }
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn id(&self) -> &str {
            &self.id
        }
        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }
        fn status(&self) -> &StatusHandle {
            &self.status
        }
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, payload: Value, _context: Value) -> Result<Value> {
            Ok(json!({ "echoed": payload }))
        }
    }

    fn echo_factory() -> WorkerFactory {
        Box::new(|spec: SpawnSpec| {
            async move { Ok(EchoWorker::new(&spec.worker_id) as Arc<dyn Worker>) }.boxed()
        })
    }

    fn fast_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.coordinator.tick_interval = Duration::from_millis(10);
        config.lifecycle.shutdown_grace = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_end_to_end_task_execution() {
        let orchestrator = Orchestrator::new(fast_config());
        orchestrator.register_type("echo", echo_factory());
        orchestrator.spawn(SpawnSpec::new("w1", "echo")).await.unwrap();
        orchestrator.start();

        let task_id = orchestrator.submit(
            Task::new("echo", json!({"text": "hello"}))
                .with_capabilities(vec!["echo".to_string()]),
        );
        let result = orchestrator
            .wait_for(task_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(
            result.result,
            Some(json!({"echoed": {"text": "hello"}}))
        );
        assert_eq!(result.worker_id.as_deref(), Some("w1"));

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.stats().registry.total_workers, 0);
    }

    #[tokio::test]
    async fn test_run_pipeline_with_dependencies() {
        let orchestrator = Orchestrator::new(fast_config());
        orchestrator.register_type("echo", echo_factory());
        orchestrator.spawn(SpawnSpec::new("w1", "echo")).await.unwrap();
        orchestrator.spawn(SpawnSpec::new("w2", "echo")).await.unwrap();
        orchestrator.start();

        let first = Task::new("echo", json!({"step": 1}));
        let second = Task::new("echo", json!({"step": 2})).with_dependencies(vec![first.id]);

        let report = orchestrator
            .run_pipeline(vec![first, second], Duration::from_secs(5))
            .await;

        assert!(report.all_completed());
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.unfinished, 0);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_aggregate_all_components() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        orchestrator.register_type("echo", echo_factory());
        orchestrator.spawn(SpawnSpec::new("w1", "echo")).await.unwrap();

        let stats = orchestrator.stats();
        assert_eq!(stats.registry.total_workers, 1);
        assert_eq!(stats.lifecycle.total_instances, 1);
        assert_eq!(stats.coordinator.total_tasks, 0);
        // Coordinator, lifecycle and the worker each own a mailbox.
        assert_eq!(stats.bus.registered_workers, 3);
    }
}
