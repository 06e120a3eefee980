use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::bus::CommunicationBus;
use crate::config::CoordinatorConfig;
use crate::registry::{Registry, RegistryEvent};
use crate::types::{
    AvailabilityState, Message, MessageKind, Task, TaskId, TaskResult, TaskStatus, WorkerId,
};

pub const COORDINATOR_ID: &str = "coordinator";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct WorkerSelection {
    pub worker_id: WorkerId,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub max_concurrent: usize,
    pub active: bool,
}

#[derive(Default)]
struct CoordinatorState {
    tasks: HashMap<TaskId, Task>,
    results: HashMap<TaskId, TaskResult>,
    running: HashMap<TaskId, WorkerId>,
    started: HashMap<TaskId, DateTime<Utc>>,
    pending: Vec<TaskId>,
    completed: Vec<TaskId>,
}

impl CoordinatorState {
    fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.results
                .get(dep)
                .map(|r| r.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }
}

/// The scheduler: accepts tasks, tracks dependencies, matches ready tasks
/// to idle workers, dispatches assignments over the bus, and supervises
/// running tasks for timeout and retry.
pub struct Coordinator {
    registry: Arc<Registry>,
    bus: Arc<CommunicationBus>,
    config: CoordinatorConfig,
    state: Arc<Mutex<CoordinatorState>>,
    active: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<CommunicationBus>,
        config: CoordinatorConfig,
    ) -> Self {
        bus.register(COORDINATOR_ID);

        let state = Arc::new(Mutex::new(CoordinatorState::default()));

        // A worker removed from the registry while holding tasks must not
        // leave them running until their timeout: requeue them right away.
        // The worker failed, not the task, so no retry is consumed.
        let listener_state = state.clone();
        registry.add_listener(Box::new(move |worker_id, event| {
            if event != RegistryEvent::Unregistered {
                return;
            }
            let mut state = listener_state.lock().unwrap();
            let orphaned: Vec<TaskId> = state
                .running
                .iter()
                .filter(|(_, assigned)| *assigned == worker_id)
                .map(|(task_id, _)| *task_id)
                .collect();
            for task_id in orphaned {
                state.running.remove(&task_id);
                state.started.remove(&task_id);
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Pending;
                    task.assigned_to = None;
                }
                state.pending.push(task_id);
                log::warn!("requeued task {task_id}: worker {worker_id} removed");
            }
        }));

        Self {
            registry,
            bus,
            config,
            state,
            active: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn submit(&self, task: Task) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let task_id = task.id;
        state.pending.push(task_id);
        state.tasks.insert(task_id, task);
        task_id
    }

    pub fn submit_many(&self, tasks: Vec<Task>) -> Vec<TaskId> {
        let mut state = self.state.lock().unwrap();
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push(task.id);
            state.pending.push(task.id);
            state.tasks.insert(task.id, task);
        }
        ids
    }

    /// Cancel a task. Succeeds only while the task is still pending.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        state.pending.retain(|id| *id != task_id);
        state.results.insert(task_id, TaskResult::cancelled(task_id));
        state.completed.push(task_id);
        true
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.state.lock().unwrap().tasks.get(&task_id).cloned()
    }

    pub fn get_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .get(&task_id)
            .map(|t| t.status)
    }

    pub fn get_result(&self, task_id: TaskId) -> Option<TaskResult> {
        self.state.lock().unwrap().results.get(&task_id).cloned()
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        worker_id: Option<&str>,
    ) -> Vec<Task> {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| worker_id.map_or(true, |w| t.assigned_to.as_deref() == Some(w)))
            .cloned()
            .collect()
    }

    /// Bounded wait for a terminal result; `None` on timeout.
    pub async fn wait_for(&self, task_id: TaskId, timeout: Duration) -> Option<TaskResult> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.get_result(task_id) {
                if result.status.is_terminal() {
                    return Some(result);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_many(
        &self,
        task_ids: &[TaskId],
        timeout: Duration,
    ) -> HashMap<TaskId, TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut results = HashMap::new();
        loop {
            for task_id in task_ids {
                if results.contains_key(task_id) {
                    continue;
                }
                if let Some(result) = self.get_result(*task_id) {
                    if result.status.is_terminal() {
                        results.insert(*task_id, result);
                    }
                }
            }
            if results.len() == task_ids.len() || Instant::now() >= deadline {
                return results;
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Record the terminal outcome of a task: store the result, finalize
    /// the task's status, and free its worker back to idle. A task reaches
    /// a terminal status at most once; later calls return false.
    pub fn record_result(&self, task_id: TaskId, mut result: TaskResult) -> bool {
        if !result.status.is_terminal() {
            return false;
        }
        let worker_to_free = {
            let mut state = self.state.lock().unwrap();
            if !state.tasks.contains_key(&task_id) || state.results.contains_key(&task_id) {
                return false;
            }

            let started_at = state.started.remove(&task_id);
            let worker = state.running.remove(&task_id);

            if result.started_at.is_none() {
                result.started_at = started_at;
            }
            let completed_at = result.completed_at.unwrap_or_else(Utc::now);
            result.completed_at = Some(completed_at);
            if result.duration.is_none() {
                result.duration = result
                    .started_at
                    .and_then(|s| (completed_at - s).to_std().ok());
            }

            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.status = result.status;
            }
            state.pending.retain(|id| *id != task_id);
            state.results.insert(task_id, result);
            state.completed.push(task_id);
            worker
        };

        if let Some(worker_id) = worker_to_free {
            self.registry
                .update_state(&worker_id, AvailabilityState::Idle);
        }
        true
    }

    pub fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            while coordinator.active.load(Ordering::SeqCst) {
                coordinator.tick().await;
                sleep(coordinator.config.tick_interval).await;
            }
        });
        *self.loop_handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One scheduling iteration: consume completions from the bus, assign
    /// ready tasks, then sweep running tasks for timeouts. Exposed so
    /// tests can drive the coordinator deterministically.
    pub async fn tick(&self) {
        self.drain_completions();
        self.schedule_pass().await;
        self.monitor_pass();
    }

    fn drain_completions(&self) {
        while let Some(message) = self.bus.try_get(COORDINATOR_ID) {
            match message.kind {
                MessageKind::TaskComplete | MessageKind::TaskFail => {
                    let Some(task_id) = parse_task_id(message.payload.get("task_id")) else {
                        log::warn!("completion message without task id from {}", message.sender);
                        continue;
                    };
                    let result = if message.kind == MessageKind::TaskComplete {
                        TaskResult::completed(
                            task_id,
                            message.sender.clone(),
                            message.payload.get("result").cloned().unwrap_or(Value::Null),
                        )
                    } else {
                        let error = message
                            .payload
                            .get("error")
                            .and_then(|e| e.as_str())
                            .unwrap_or("unknown error");
                        TaskResult::failed(task_id, Some(message.sender.clone()), error)
                    };
                    if !self.record_result(task_id, result) {
                        log::debug!("dropped duplicate result for task {task_id}");
                    }
                }
                _ => {}
            }
        }
    }

    async fn schedule_pass(&self) {
        // Snapshot the ready set under the state lock; registry queries
        // happen after it is released.
        let (ready, mut claimed, running_counts, capacity) = {
            let state = self.state.lock().unwrap();
            let capacity = self
                .config
                .max_concurrent_tasks
                .saturating_sub(state.running.len());
            if capacity == 0 {
                return;
            }

            let mut ready: Vec<Task> = state
                .pending
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Retrying))
                .filter(|t| state.dependencies_satisfied(t))
                .cloned()
                .collect();
            // Priority descending; the sort is stable, so submission order
            // breaks ties.
            ready.sort_by(|a, b| b.priority.cmp(&a.priority));

            let claimed: HashSet<WorkerId> = state.running.values().cloned().collect();
            let mut counts: HashMap<WorkerId, usize> = HashMap::new();
            for worker in state.running.values() {
                *counts.entry(worker.clone()).or_insert(0) += 1;
            }
            (ready, claimed, counts, capacity)
        };

        let mut assignments: Vec<(TaskId, WorkerSelection)> = Vec::new();
        for task in &ready {
            if assignments.len() >= capacity {
                break;
            }
            if let Some(selection) = self.select_worker(task, &claimed, &running_counts) {
                claimed.insert(selection.worker_id.clone());
                assignments.push((task.id, selection));
            }
            // No eligible worker is not an error; the task stays pending
            // and is retried next tick.
        }

        for (task_id, selection) in assignments {
            let message = {
                let mut state = self.state.lock().unwrap();
                let Some(task) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                if !matches!(task.status, TaskStatus::Pending | TaskStatus::Retrying) {
                    continue;
                }
                task.status = TaskStatus::Assigned;
                task.assigned_to = Some(selection.worker_id.clone());
                let assign = Message::new(
                    MessageKind::TaskAssign,
                    COORDINATOR_ID,
                    selection.worker_id.clone(),
                )
                .with_payload(
                    "task",
                    serde_json::to_value(&*task).unwrap_or(Value::Null),
                )
                .with_payload("context", task.context.clone());

                state.running.insert(task_id, selection.worker_id.clone());
                state.started.insert(task_id, Utc::now());
                state.pending.retain(|id| *id != task_id);
                assign
            };

            self.registry
                .update_state(&selection.worker_id, AvailabilityState::Busy);
            log::debug!(
                "assigned task {task_id} to {} (score {:.1})",
                selection.worker_id,
                selection.score
            );
            if self.bus.send(message).await {
                let mut state = self.state.lock().unwrap();
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Running;
                }
            } else {
                log::warn!(
                    "assignment delivery to {} failed; task {task_id} awaits timeout",
                    selection.worker_id
                );
            }
        }
    }

    /// Pick the best idle worker for a task: all required capabilities,
    /// all required tags, not already claimed. Scoring prefers idle
    /// workers and penalizes load; ties resolve to the first candidate.
    fn select_worker(
        &self,
        task: &Task,
        claimed: &HashSet<WorkerId>,
        running_counts: &HashMap<WorkerId, usize>,
    ) -> Option<WorkerSelection> {
        let candidates = self.registry.find_by_capabilities(&task.required_capabilities);

        let mut best: Option<WorkerSelection> = None;
        for worker_id in candidates {
            if claimed.contains(&worker_id) {
                continue;
            }
            let Some(meta) = self.registry.metadata(&worker_id) else {
                continue;
            };
            if meta.state != AvailabilityState::Idle {
                continue;
            }
            if !task.required_tags.iter().all(|tag| meta.tags.contains(tag)) {
                continue;
            }

            let mut score = 10.0;
            let mut reasons = vec!["worker_idle".to_string()];
            let load = running_counts.get(&worker_id).copied().unwrap_or(0);
            score -= load as f64 * 2.0;
            if load == 0 {
                reasons.push("no_load".to_string());
            }

            let better = best
                .as_ref()
                .map(|b| score > b.score)
                .unwrap_or(true);
            if better {
                best = Some(WorkerSelection {
                    worker_id,
                    score,
                    reasons,
                });
            }
        }
        best
    }

    /// Sweep running tasks whose assignment has outlived its timeout:
    /// retry while the budget lasts, otherwise finalize as failed.
    fn monitor_pass(&self) {
        let now = Utc::now();
        let mut freed: Vec<WorkerId> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let running: Vec<(TaskId, WorkerId)> = state
                .running
                .iter()
                .map(|(t, w)| (*t, w.clone()))
                .collect();

            for (task_id, worker_id) in running {
                let Some((timeout, retry_count, max_retries)) = state
                    .tasks
                    .get(&task_id)
                    .map(|t| (t.timeout, t.retry_count, t.max_retries))
                else {
                    continue;
                };
                let expired = state
                    .started
                    .get(&task_id)
                    .and_then(|s| (now - *s).to_std().ok())
                    .map(|elapsed| elapsed > timeout)
                    .unwrap_or(false);
                if !expired {
                    continue;
                }

                state.running.remove(&task_id);
                let started_at = state.started.remove(&task_id);

                if retry_count < max_retries {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.retry_count += 1;
                        task.status = TaskStatus::Retrying;
                        task.assigned_to = None;
                    }
                    state.pending.push(task_id);
                    log::warn!(
                        "task {task_id} timed out on {worker_id}, retry {}",
                        retry_count + 1
                    );
                } else {
                    if let Some(task) = state.tasks.get_mut(&task_id) {
                        task.status = TaskStatus::Failed;
                    }
                    let mut result =
                        TaskResult::failed(task_id, Some(worker_id.clone()), "Task timed out");
                    result.started_at = started_at;
                    result.completed_at = Some(now);
                    result.duration = started_at.and_then(|s| (now - s).to_std().ok());
                    state.results.insert(task_id, result);
                    state.completed.push(task_id);
                    log::warn!("task {task_id} failed after exhausting retries");
                }
                freed.push(worker_id);
            }
        }

        for worker_id in freed {
            self.registry.update_state(&worker_id, AvailabilityState::Idle);
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock().unwrap();
        CoordinatorStats {
            total_tasks: state.tasks.len(),
            pending_tasks: state.pending.len(),
            running_tasks: state.running.len(),
            completed_tasks: state.completed.len(),
            max_concurrent: self.config.max_concurrent_tasks,
            active: self.active.load(Ordering::SeqCst),
        }
    }
}

fn parse_task_id(value: Option<&Value>) -> Option<TaskId> {
    value?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::worker::{Capability, StatusHandle, Worker};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;

    struct StubWorker {
        id: String,
        capabilities: Vec<Capability>,
        status: StatusHandle,
    }

    impl StubWorker {
        fn new(id: &str, caps: &[&str]) -> Arc<Self> {
            let capabilities: Vec<Capability> =
                caps.iter().map(|c| Capability::new(*c, "")).collect();
            Arc::new(Self {
                id: id.to_string(),
                status: StatusHandle::new(id, &capabilities),
                capabilities,
            })
        }
    }

    #[async_trait]
    impl Worker for StubWorker {
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
            Ok(payload)
        }
    }

    fn setup() -> (Arc<Registry>, Arc<CommunicationBus>, Arc<Coordinator>) {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(CommunicationBus::new(BusConfig::default()));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            bus.clone(),
            CoordinatorConfig::default(),
        ));
        (registry, bus, coordinator)
    }

    fn register_worker(registry: &Registry, bus: &CommunicationBus, id: &str, caps: &[&str]) {
        registry
            .register(StubWorker::new(id, caps), "stub", vec![])
            .unwrap();
        bus.register(id);
    }

    #[tokio::test]
    async fn test_assignment_flow() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &["build"]);

        let task = Task::new("build", json!({}))
            .with_capabilities(vec!["build".to_string()]);
        let task_id = coordinator.submit(task);

        coordinator.tick().await;

        assert_eq!(coordinator.get_status(task_id), Some(TaskStatus::Running));
        assert_eq!(
            coordinator.get_task(task_id).unwrap().assigned_to.as_deref(),
            Some("w1")
        );
        assert_eq!(
            registry.metadata("w1").unwrap().state,
            AvailabilityState::Busy
        );

        // The assignment message reached the worker's mailbox.
        let msg = bus.try_get("w1").unwrap();
        assert_eq!(msg.kind, MessageKind::TaskAssign);
    }

    #[tokio::test]
    async fn test_no_eligible_worker_keeps_task_pending() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &["other"]);

        let task_id = coordinator.submit(
            Task::new("build", json!({})).with_capabilities(vec!["build".to_string()]),
        );

        coordinator.tick().await;
        assert_eq!(coordinator.get_status(task_id), Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_priority_ordering_under_capacity_limit() {
        let registry = Arc::new(Registry::new());
        let bus = Arc::new(CommunicationBus::new(BusConfig::default()));
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            bus.clone(),
            CoordinatorConfig {
                max_concurrent_tasks: 1,
                ..CoordinatorConfig::default()
            },
        ));
        register_worker(&registry, &bus, "w1", &[]);
        register_worker(&registry, &bus, "w2", &[]);

        let low = coordinator.submit(Task::new("t", json!({})).with_priority(1));
        let high = coordinator.submit(Task::new("t", json!({})).with_priority(5));

        coordinator.tick().await;

        assert_eq!(coordinator.get_status(high), Some(TaskStatus::Running));
        assert_eq!(coordinator.get_status(low), Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_dependency_ordering() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let a = Task::new("a", json!({}));
        let a_id = a.id;
        let b = Task::new("b", json!({})).with_dependencies(vec![a_id]);
        let b_id = b.id;

        // Submit the dependent first; it must still wait for A.
        coordinator.submit(b);
        coordinator.submit(a);

        coordinator.tick().await;
        assert_eq!(coordinator.get_status(a_id), Some(TaskStatus::Running));
        assert_eq!(coordinator.get_status(b_id), Some(TaskStatus::Pending));

        coordinator.record_result(a_id, TaskResult::completed(a_id, "w1", json!({})));
        coordinator.tick().await;
        assert_eq!(coordinator.get_status(b_id), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_busy_worker_not_double_assigned() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let first = coordinator.submit(Task::new("t", json!({})));
        let second = coordinator.submit(Task::new("t", json!({})));

        coordinator.tick().await;
        assert_eq!(coordinator.get_status(first), Some(TaskStatus::Running));
        assert_eq!(coordinator.get_status(second), Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_timeout_retries_then_fails() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let task_id = coordinator.submit(
            Task::new("t", json!({}))
                .with_timeout(Duration::from_millis(20))
                .with_max_retries(2),
        );

        for expected_retry in 1..=2u32 {
            coordinator.tick().await;
            assert_eq!(coordinator.get_status(task_id), Some(TaskStatus::Running));
            sleep(Duration::from_millis(30)).await;
            coordinator.tick().await;
            let task = coordinator.get_task(task_id).unwrap();
            assert_eq!(task.retry_count, expected_retry);
            assert!(matches!(
                task.status,
                TaskStatus::Retrying | TaskStatus::Running
            ));
            // The worker was freed for the next attempt.
        }

        // Third and final assignment exhausts the budget.
        coordinator.tick().await;
        sleep(Duration::from_millis(30)).await;
        coordinator.tick().await;

        let result = coordinator.get_result(task_id).unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Task timed out"));
        assert_eq!(coordinator.get_task(task_id).unwrap().retry_count, 2);
        assert_eq!(
            registry.metadata("w1").unwrap().state,
            AvailabilityState::Idle
        );

        // One assignment message per attempt: initial plus two retries.
        let assigns = bus.history(Some("w1"), Some(MessageKind::TaskAssign), 100);
        assert_eq!(assigns.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (registry, bus, coordinator) = setup();

        let task_id = coordinator.submit(Task::new("t", json!({})));
        assert!(coordinator.cancel(task_id));
        assert_eq!(coordinator.get_status(task_id), Some(TaskStatus::Cancelled));
        // Terminal at most once: a second cancel fails.
        assert!(!coordinator.cancel(task_id));

        register_worker(&registry, &bus, "w1", &[]);
        let running = coordinator.submit(Task::new("t", json!({})));
        coordinator.tick().await;
        assert!(!coordinator.cancel(running));
    }

    #[tokio::test]
    async fn test_record_result_is_terminal_once() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let task_id = coordinator.submit(Task::new("t", json!({})));
        coordinator.tick().await;

        assert!(coordinator.record_result(
            task_id,
            TaskResult::completed(task_id, "w1", json!({"ok": true}))
        ));
        assert!(!coordinator.record_result(
            task_id,
            TaskResult::failed(task_id, Some("w1".to_string()), "late")
        ));

        let result = coordinator.get_result(task_id).unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert!(result.duration.is_some());
        assert_eq!(
            registry.metadata("w1").unwrap().state,
            AvailabilityState::Idle
        );
    }

    #[tokio::test]
    async fn test_completion_message_drained_from_bus() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let task_id = coordinator.submit(Task::new("t", json!({})));
        coordinator.tick().await;

        let done = Message::new(MessageKind::TaskComplete, "w1", COORDINATOR_ID)
            .with_payload("task_id", json!(task_id.to_string()))
            .with_payload("result", json!({"answer": 42}));
        bus.send(done).await;

        coordinator.tick().await;

        let result = coordinator.get_result(task_id).unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(json!({"answer": 42})));
        assert_eq!(result.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_unregistered_worker_tasks_requeued() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let task_id = coordinator.submit(Task::new("t", json!({})));
        coordinator.tick().await;
        assert_eq!(coordinator.get_status(task_id), Some(TaskStatus::Running));

        registry.unregister("w1").unwrap();

        let task = coordinator.get_task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_to.is_none());
        assert_eq!(coordinator.stats().running_tasks, 0);
    }

    #[tokio::test]
    async fn test_required_tags_filter_candidates() {
        let (registry, bus, coordinator) = setup();
        registry
            .register(
                StubWorker::new("tagged", &["run"]),
                "stub",
                vec!["gpu".to_string()],
            )
            .unwrap();
        bus.register("tagged");
        register_worker(&registry, &bus, "untagged", &["run"]);

        let task_id = coordinator.submit(
            Task::new("t", json!({}))
                .with_capabilities(vec!["run".to_string()])
                .with_tags(vec!["gpu".to_string()]),
        );

        coordinator.tick().await;
        assert_eq!(
            coordinator.get_task(task_id).unwrap().assigned_to.as_deref(),
            Some("tagged")
        );
    }

    #[tokio::test]
    async fn test_wait_for() {
        let (registry, bus, coordinator) = setup();
        register_worker(&registry, &bus, "w1", &[]);

        let task_id = coordinator.submit(Task::new("t", json!({})));
        coordinator.tick().await;

        let waiter = coordinator.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for(task_id, Duration::from_secs(2)).await
        });

        sleep(Duration::from_millis(100)).await;
        coordinator.record_result(task_id, TaskResult::completed(task_id, "w1", json!({})));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Completed);

        // Timeout path returns None.
        let missing = coordinator
            .wait_for(TaskId::new_v4(), Duration::from_millis(60))
            .await;
        assert!(missing.is_none());
    }
}
