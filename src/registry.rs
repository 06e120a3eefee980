use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::error::ForemanError;
use crate::types::{AvailabilityState, WorkerId};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered,
    Unregistered,
}

pub type RegistryListener = Box<dyn Fn(&WorkerId, RegistryEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

#[derive(Debug, Clone)]
pub struct WorkerMetadata {
    pub worker_id: WorkerId,
    pub worker_type: String,
    pub capabilities: Vec<String>,
    pub state: AvailabilityState,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub by_state: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
    pub total_capabilities: usize,
    pub total_tags: usize,
}

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
    metadata: HashMap<WorkerId, WorkerMetadata>,
    capability_index: HashMap<String, HashSet<WorkerId>>,
    tag_index: HashMap<String, HashSet<WorkerId>>,
}

/// Catalog of known workers: identity, capabilities, tags, availability.
/// Sole source of truth for worker availability.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    listeners: Mutex<Vec<(ListenerId, RegistryListener)>>,
    next_listener_id: Mutex<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
        }
    }

    pub fn register(
        &self,
        worker: Arc<dyn Worker>,
        worker_type: &str,
        tags: Vec<String>,
    ) -> Result<()> {
        let worker_id: WorkerId = worker.id().to_string();
        {
            let mut inner = self.inner.write().unwrap();
            if inner.workers.contains_key(&worker_id) {
                return Err(ForemanError::WorkerAlreadyRegistered(worker_id).into());
            }

            let capabilities: Vec<String> = worker
                .capabilities()
                .iter()
                .map(|c| c.name.clone())
                .collect();

            for cap in &capabilities {
                inner
                    .capability_index
                    .entry(cap.clone())
                    .or_default()
                    .insert(worker_id.clone());
            }
            for tag in &tags {
                inner
                    .tag_index
                    .entry(tag.clone())
                    .or_default()
                    .insert(worker_id.clone());
            }

            let now = Utc::now();
            inner.metadata.insert(
                worker_id.clone(),
                WorkerMetadata {
                    worker_id: worker_id.clone(),
                    worker_type: worker_type.to_string(),
                    capabilities,
                    state: AvailabilityState::Idle,
                    created_at: now,
                    last_seen: now,
                    tags,
                },
            );
            inner.workers.insert(worker_id.clone(), worker);
        }

        self.notify(&worker_id, RegistryEvent::Registered);
        Ok(())
    }

    pub fn unregister(&self, worker_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write().unwrap();
            if !inner.workers.contains_key(worker_id) {
                return Err(ForemanError::WorkerNotFound(worker_id.to_string()).into());
            }

            if let Some(meta) = inner.metadata.get_mut(worker_id) {
                meta.state = AvailabilityState::Terminated;
            }

            let meta = inner.metadata.remove(worker_id);
            if let Some(meta) = meta {
                for cap in &meta.capabilities {
                    if let Some(ids) = inner.capability_index.get_mut(cap) {
                        ids.remove(worker_id);
                    }
                }
                for tag in &meta.tags {
                    if let Some(ids) = inner.tag_index.get_mut(tag) {
                        ids.remove(worker_id);
                    }
                }
            }
            inner.workers.remove(worker_id);
        }

        self.notify(&worker_id.to_string(), RegistryEvent::Unregistered);
        Ok(())
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        self.inner.read().unwrap().workers.get(worker_id).cloned()
    }

    pub fn metadata(&self, worker_id: &str) -> Option<WorkerMetadata> {
        self.inner.read().unwrap().metadata.get(worker_id).cloned()
    }

    pub fn list(
        &self,
        worker_type: Option<&str>,
        state: Option<AvailabilityState>,
        tags: Option<&[String]>,
    ) -> Vec<WorkerMetadata> {
        let inner = self.inner.read().unwrap();
        let mut results: Vec<WorkerMetadata> = inner
            .metadata
            .values()
            .filter(|m| worker_type.map_or(true, |t| m.worker_type == t))
            .filter(|m| state.map_or(true, |s| m.state == s))
            .filter(|m| {
                tags.map_or(true, |wanted| {
                    wanted.iter().all(|tag| m.tags.contains(tag))
                })
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        results
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<WorkerId> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<WorkerId> = inner
            .capability_index
            .get(capability)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Workers advertising all of `capabilities`. An empty filter matches
    /// every registered worker. Results are id-sorted so selection ties
    /// resolve deterministically.
    pub fn find_by_capabilities(&self, capabilities: &[String]) -> Vec<WorkerId> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<WorkerId> = if capabilities.is_empty() {
            inner.workers.keys().cloned().collect()
        } else {
            let mut sets = capabilities
                .iter()
                .map(|cap| inner.capability_index.get(cap).cloned().unwrap_or_default());
            let first = match sets.next() {
                Some(set) => set,
                None => return Vec::new(),
            };
            sets.fold(first, |acc, set| &acc & &set).into_iter().collect()
        };
        ids.sort();
        ids
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<WorkerId> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<WorkerId> = inner
            .tag_index
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn find_by_tags(&self, tags: &[String]) -> Vec<WorkerId> {
        let inner = self.inner.read().unwrap();
        let mut ids: Vec<WorkerId> = if tags.is_empty() {
            inner.workers.keys().cloned().collect()
        } else {
            let mut sets = tags
                .iter()
                .map(|tag| inner.tag_index.get(tag).cloned().unwrap_or_default());
            let first = match sets.next() {
                Some(set) => set,
                None => return Vec::new(),
            };
            sets.fold(first, |acc, set| &acc & &set).into_iter().collect()
        };
        ids.sort();
        ids
    }

    /// Set a worker's availability and refresh its last-seen timestamp.
    /// Unknown ids are ignored.
    pub fn update_state(&self, worker_id: &str, state: AvailabilityState) {
        let mut inner = self.inner.write().unwrap();
        if let Some(meta) = inner.metadata.get_mut(worker_id) {
            meta.state = state;
            meta.last_seen = Utc::now();
        }
    }

    pub fn available_workers(&self) -> Vec<WorkerMetadata> {
        self.list(None, Some(AvailabilityState::Idle), None)
    }

    pub fn count(&self, worker_type: Option<&str>, state: Option<AvailabilityState>) -> usize {
        self.list(worker_type, state, None).len()
    }

    pub fn add_listener(&self, listener: RegistryListener) -> ListenerId {
        let mut next = self.next_listener_id.lock().unwrap();
        let id = ListenerId(*next);
        *next += 1;
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    /// Remove workers unseen for longer than `timeout`. Returns the ids
    /// that were removed.
    pub fn cleanup_stale(&self, timeout: Duration) -> Vec<WorkerId> {
        let now = Utc::now();
        let stale: Vec<WorkerId> = {
            let inner = self.inner.read().unwrap();
            inner
                .metadata
                .values()
                .filter(|m| {
                    (now - m.last_seen)
                        .to_std()
                        .map(|age| age > timeout)
                        .unwrap_or(false)
                })
                .map(|m| m.worker_id.clone())
                .collect()
        };

        let mut removed = Vec::new();
        for worker_id in stale {
            if self.unregister(&worker_id).is_ok() {
                log::warn!("removed stale worker {worker_id}");
                removed.push(worker_id);
            }
        }
        removed
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().unwrap();
        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for meta in inner.metadata.values() {
            *by_state.entry(meta.state.as_str().to_string()).or_insert(0) += 1;
            *by_type.entry(meta.worker_type.clone()).or_insert(0) += 1;
        }
        RegistryStats {
            total_workers: inner.workers.len(),
            by_state,
            by_type,
            total_capabilities: inner.capability_index.len(),
            total_tags: inner.tag_index.len(),
        }
    }

    /// Invoke listeners outside the state lock; a panicking listener must
    /// not abort the operation or the other listeners.
    fn notify(&self, worker_id: &WorkerId, event: RegistryEvent) {
        let listeners = self.listeners.lock().unwrap();
        for (_, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(worker_id, event))).is_err() {
                log::warn!("registry listener panicked on {event:?} for {worker_id}");
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
