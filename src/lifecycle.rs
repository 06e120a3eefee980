use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::bus::CommunicationBus;
use crate::config::LifecycleConfig;
use crate::error::ForemanError;
use crate::registry::Registry;
use crate::types::{AvailabilityState, LifecycleState, Message, MessageKind, WorkerId};
use crate::worker::Worker;

pub const LIFECYCLE_ID: &str = "lifecycle";

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub tags: Vec<String>,
    pub config: Value,
}

impl SpawnSpec {
    pub fn new(worker_id: impl Into<WorkerId>, worker_type: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_type: worker_type.into(),
            tags: Vec::new(),
            config: Value::Null,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Builds a worker for a registered type. The factory only constructs;
/// `initialize` is driven by the manager afterwards.
pub type WorkerFactory =
    Box<dyn Fn(SpawnSpec) -> BoxFuture<'static, Result<Arc<dyn Worker>>> + Send + Sync>;

pub type StateCallback = Box<dyn Fn(&WorkerId, LifecycleState, LifecycleState) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&WorkerId, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(usize);

#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub state: LifecycleState,
    pub spawned_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LifecycleStats {
    pub registered_types: usize,
    pub total_instances: usize,
    pub by_state: HashMap<String, usize>,
    pub monitoring: bool,
}

/// Spawns workers from registered factories, walks them through their
/// lifecycle states, supervises heartbeats, and tears them down. Talks
/// only to the registry and the bus; task scheduling is not its concern.
pub struct LifecycleManager {
    registry: Arc<Registry>,
    bus: Arc<CommunicationBus>,
    config: LifecycleConfig,
    factories: RwLock<HashMap<String, WorkerFactory>>,
    instances: Mutex<HashMap<WorkerId, WorkerInstance>>,
    state_callbacks: Mutex<Vec<(CallbackId, StateCallback)>>,
    error_callbacks: Mutex<Vec<(CallbackId, ErrorCallback)>>,
    next_callback_id: Mutex<usize>,
    monitoring: AtomicBool,
    monitor_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<CommunicationBus>,
        config: LifecycleConfig,
    ) -> Self {
        bus.register(LIFECYCLE_ID);
        Self {
            registry,
            bus,
            config,
            factories: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            state_callbacks: Mutex::new(Vec::new()),
            error_callbacks: Mutex::new(Vec::new()),
            next_callback_id: Mutex::new(0),
            monitoring: AtomicBool::new(false),
            monitor_handles: Mutex::new(Vec::new()),
        }
    }

    /// A second registration for the same name replaces the factory.
    pub fn register_type(&self, worker_type: &str, factory: WorkerFactory) {
        self.factories
            .write()
            .unwrap()
            .insert(worker_type.to_string(), factory);
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().unwrap().keys().cloned().collect();
        types.sort();
        types
    }

    /// Spawn a worker: build it from its type's factory, initialize it,
    /// and register it everywhere. On any failure the partially created
    /// instance is rolled back and no trace of it remains.
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<WorkerId> {
        let worker_id = spec.worker_id.clone();

        {
            let mut instances = self.instances.lock().unwrap();
            if instances
                .get(&worker_id)
                .map(|i| !i.state.is_terminal())
                .unwrap_or(false)
            {
                return Err(ForemanError::WorkerAlreadySpawned(worker_id).into());
            }
            let now = Utc::now();
            instances.insert(
                worker_id.clone(),
                WorkerInstance {
                    worker_id: worker_id.clone(),
                    worker_type: spec.worker_type.clone(),
                    state: LifecycleState::Initializing,
                    spawned_at: now,
                    last_heartbeat: now,
                    last_error: None,
                },
            );
        }

        match self.spawn_inner(&spec).await {
            Ok(()) => {
                log::info!("spawned worker {worker_id} ({})", spec.worker_type);
                Ok(worker_id)
            }
            Err(error) => {
                // Roll back every side effect of the partial spawn.
                let _ = self.registry.unregister(&worker_id);
                self.bus.unregister(&worker_id);
                self.instances.lock().unwrap().remove(&worker_id);
                log::warn!("spawn of {worker_id} failed: {error:#}");
                Err(error)
            }
        }
    }

    async fn spawn_inner(&self, spec: &SpawnSpec) -> Result<()> {
        let factory_future = {
            let factories = self.factories.read().unwrap();
            let factory = factories
                .get(&spec.worker_type)
                .ok_or_else(|| ForemanError::UnknownWorkerType(spec.worker_type.clone()))?;
            factory(spec.clone())
        };

        let worker = factory_future
            .await
            .with_context(|| format!("factory for type {} failed", spec.worker_type))?;

        worker
            .initialize()
            .await
            .with_context(|| format!("initialization of {} failed", spec.worker_id))?;

        self.bus.register(&spec.worker_id);
        self.registry
            .register(worker, &spec.worker_type, spec.tags.clone())?;

        self.transition(&spec.worker_id, LifecycleState::Ready)?;
        self.transition(&spec.worker_id, LifecycleState::Idle)?;
        Ok(())
    }

    pub async fn spawn_many(&self, specs: Vec<SpawnSpec>) -> Vec<Result<WorkerId>> {
        join_all(specs.into_iter().map(|spec| self.spawn(spec))).await
    }

    /// Terminate a worker. Graceful termination sends a shutdown message
    /// and waits out the grace period before running the worker's
    /// `shutdown` hook; forced termination runs the hook immediately. A
    /// failing hook demotes the worker to error and notifies the error
    /// callbacks, the instance is still force-removed, and the failure is
    /// returned. The instance record survives in the `Terminated` state.
    pub async fn terminate(&self, worker_id: &str, graceful: bool) -> Result<()> {
        self.transition(worker_id, LifecycleState::ShuttingDown)?;

        if graceful {
            let notice = Message::new(MessageKind::Shutdown, LIFECYCLE_ID, worker_id);
            self.bus.send(notice).await;
            sleep(self.config.shutdown_grace).await;
        }

        let mut hook_failure = None;
        if let Some(worker) = self.registry.get(worker_id) {
            if let Err(error) = worker.shutdown().await {
                self.fail_worker(worker_id, &format!("shutdown hook failed: {error:#}"));
                hook_failure = Some(error);
            }
        }

        let _ = self.registry.unregister(worker_id);
        self.bus.unregister(worker_id);
        self.transition(worker_id, LifecycleState::Terminated)?;

        match hook_failure {
            None => {
                log::info!("terminated worker {worker_id}");
                Ok(())
            }
            Some(error) => {
                Err(error.context(format!("shutdown hook of {worker_id} failed")))
            }
        }
    }

    /// Terminate every non-terminal instance; returns how many shut down
    /// cleanly.
    pub async fn terminate_all(&self, graceful: bool) -> usize {
        let alive: Vec<WorkerId> = {
            let instances = self.instances.lock().unwrap();
            instances
                .values()
                .filter(|i| !i.state.is_terminal())
                .map(|i| i.worker_id.clone())
                .collect()
        };
        let mut terminated = 0;
        for worker_id in alive {
            match self.terminate(&worker_id, graceful).await {
                Ok(()) => terminated += 1,
                Err(error) => log::warn!("termination of {worker_id} failed: {error:#}"),
            }
        }
        terminated
    }

    pub fn get_instance(&self, worker_id: &str) -> Option<WorkerInstance> {
        self.instances.lock().unwrap().get(worker_id).cloned()
    }

    pub fn list_instances(&self, state: Option<LifecycleState>) -> Vec<WorkerInstance> {
        let instances = self.instances.lock().unwrap();
        let mut results: Vec<WorkerInstance> = instances
            .values()
            .filter(|i| state.map_or(true, |s| i.state == s))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        results
    }

    pub fn get_state(&self, worker_id: &str) -> Option<LifecycleState> {
        self.instances
            .lock()
            .unwrap()
            .get(worker_id)
            .map(|i| i.state)
    }

    pub fn is_alive(&self, worker_id: &str) -> bool {
        self.get_state(worker_id)
            .map(|s| s.is_alive())
            .unwrap_or(false)
    }

    /// Unknown ids are ignored; replies can arrive after termination.
    pub fn record_heartbeat(&self, worker_id: &str) {
        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.get_mut(worker_id) {
            instance.last_heartbeat = Utc::now();
        }
    }

    /// Move a worker to `to`, validating the transition, mirroring the
    /// availability into the registry, and firing state callbacks.
    pub fn transition(&self, worker_id: &str, to: LifecycleState) -> Result<()> {
        let from = {
            let mut instances = self.instances.lock().unwrap();
            let instance = instances
                .get_mut(worker_id)
                .ok_or_else(|| ForemanError::WorkerNotFound(worker_id.to_string()))?;
            if !instance.state.can_transition(to) {
                return Err(ForemanError::InvalidTransition {
                    worker: worker_id.to_string(),
                    from: instance.state,
                    to,
                }
                .into());
            }
            let from = instance.state;
            instance.state = to;
            from
        };

        // The registry entry exists only between spawn registration and
        // termination; update_state ignores unknown ids.
        self.registry
            .update_state(worker_id, AvailabilityState::from(to));
        log::debug!("worker {worker_id}: {} -> {}", from.as_str(), to.as_str());

        let worker_id = worker_id.to_string();
        let callbacks = self.state_callbacks.lock().unwrap();
        for (_, callback) in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&worker_id, from, to))).is_err() {
                log::warn!("state callback panicked for {worker_id}");
            }
        }
        Ok(())
    }

    pub fn fail_worker(&self, worker_id: &str, reason: &str) {
        {
            let mut instances = self.instances.lock().unwrap();
            match instances.get_mut(worker_id) {
                Some(instance) if instance.state.can_transition(LifecycleState::Error) => {
                    instance.last_error = Some(reason.to_string());
                }
                _ => return,
            }
        }
        if self.transition(worker_id, LifecycleState::Error).is_err() {
            return;
        }
        log::warn!("worker {worker_id} entered error state: {reason}");

        let worker_id = worker_id.to_string();
        let callbacks = self.error_callbacks.lock().unwrap();
        for (_, callback) in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&worker_id, reason))).is_err() {
                log::warn!("error callback panicked for {worker_id}");
            }
        }
    }

    pub fn add_state_callback(&self, callback: StateCallback) -> CallbackId {
        let id = self.next_callback_id();
        self.state_callbacks.lock().unwrap().push((id, callback));
        id
    }

    pub fn add_error_callback(&self, callback: ErrorCallback) -> CallbackId {
        let id = self.next_callback_id();
        self.error_callbacks.lock().unwrap().push((id, callback));
        id
    }

    pub fn remove_callback(&self, id: CallbackId) {
        self.state_callbacks
            .lock()
            .unwrap()
            .retain(|(cid, _)| *cid != id);
        self.error_callbacks
            .lock()
            .unwrap()
            .retain(|(cid, _)| *cid != id);
    }

    fn next_callback_id(&self) -> CallbackId {
        let mut next = self.next_callback_id.lock().unwrap();
        let id = CallbackId(*next);
        *next += 1;
        id
    }

    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = self.clone();
        let heartbeat_loop = tokio::spawn(async move {
            while manager.monitoring.load(Ordering::SeqCst) {
                manager.heartbeat_pass().await;
                sleep(manager.config.heartbeat_interval).await;
            }
        });

        let manager = self.clone();
        let health_loop = tokio::spawn(async move {
            while manager.monitoring.load(Ordering::SeqCst) {
                manager.health_check_pass();
                sleep(manager.config.health_check_interval).await;
            }
        });

        let mut handles = self.monitor_handles.lock().unwrap();
        handles.push(heartbeat_loop);
        handles.push(health_loop);
    }

    pub async fn stop_monitoring(&self) {
        self.monitoring.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> =
            self.monitor_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Fold queued replies into the heartbeat records, then ping every
    /// alive worker. Exposed so tests can drive the monitor directly.
    pub async fn heartbeat_pass(&self) {
        while let Some(message) = self.bus.try_get(LIFECYCLE_ID) {
            if matches!(
                message.kind,
                MessageKind::Heartbeat | MessageKind::StatusResponse
            ) {
                self.record_heartbeat(&message.sender);
            }
        }

        let alive: Vec<WorkerId> = {
            let instances = self.instances.lock().unwrap();
            instances
                .values()
                .filter(|i| i.state.is_alive())
                .map(|i| i.worker_id.clone())
                .collect()
        };
        for worker_id in alive {
            let ping = Message::new(MessageKind::Heartbeat, LIFECYCLE_ID, worker_id);
            self.bus.send(ping).await;
        }
    }

    /// Demote workers that missed two consecutive heartbeat windows.
    pub fn health_check_pass(&self) {
        let now = Utc::now();
        let cutoff = self.config.heartbeat_interval * 2;
        let alive: Vec<(WorkerId, DateTime<Utc>)> = {
            let instances = self.instances.lock().unwrap();
            instances
                .values()
                .filter(|i| i.state.is_alive())
                .map(|i| (i.worker_id.clone(), i.last_heartbeat))
                .collect()
        };

        for (worker_id, last_heartbeat) in alive {
            let silent_for = (now - last_heartbeat).to_std().unwrap_or_default();
            if silent_for > cutoff {
                self.fail_worker(&worker_id, "heartbeat timeout");
            }
        }
    }

    pub fn stats(&self) -> LifecycleStats {
        let instances = self.instances.lock().unwrap();
        let mut by_state: HashMap<String, usize> = HashMap::new();
        for instance in instances.values() {
            *by_state
                .entry(instance.state.as_str().to_string())
                .or_insert(0) += 1;
        }
        LifecycleStats {
            registered_types: self.factories.read().unwrap().len(),
            total_instances: instances.len(),
            by_state,
            monitoring: self.monitoring.load(Ordering::SeqCst),
        }
    }
}
