use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::BusConfig;
use crate::types::{Message, MessageId, MessageKind, WorkerId};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Mailbox {
    worker_id: WorkerId,
    capacity: usize,
    inbound: Mutex<VecDeque<Message>>,
    outbound: Mutex<VecDeque<Message>>,
}

impl Mailbox {
    fn new(worker_id: WorkerId, capacity: usize) -> Self {
        Self {
            worker_id,
            capacity,
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn push_inbound(&self, message: Message) -> bool {
        let mut queue = self.inbound.lock().unwrap();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(message);
        true
    }

    fn pop_inbound(&self) -> Option<Message> {
        self.inbound.lock().unwrap().pop_front()
    }

    fn push_outbound(&self, message: Message) -> bool {
        let mut queue = self.outbound.lock().unwrap();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(message);
        true
    }

    fn pop_outbound(&self) -> Option<Message> {
        self.outbound.lock().unwrap().pop_front()
    }

    /// Remove and return the first inbound message matching `correlation`.
    /// Other messages keep their order.
    fn take_correlated(&self, correlation: MessageId) -> Option<Message> {
        let mut queue = self.inbound.lock().unwrap();
        let position = queue
            .iter()
            .position(|m| m.correlation_id == Some(correlation))?;
        queue.remove(position)
    }

    pub fn sizes(&self) -> (usize, usize) {
        (
            self.inbound.lock().unwrap().len(),
            self.outbound.lock().unwrap().len(),
        )
    }

    fn clear(&self) {
        self.inbound.lock().unwrap().clear();
        self.outbound.lock().unwrap().clear();
    }
}

#[derive(Debug, Clone)]
pub struct BusStats {
    pub registered_workers: usize,
    pub topics: usize,
    pub history_len: usize,
    pub relay_running: bool,
}

/// Per-worker mailbox transport: point-to-point send, topic publish and
/// broadcast, bounded history. Pure transport, no scheduling logic.
pub struct CommunicationBus {
    config: BusConfig,
    mailboxes: RwLock<HashMap<WorkerId, Arc<Mailbox>>>,
    subscribers: Mutex<HashMap<String, HashSet<WorkerId>>>,
    history: Mutex<VecDeque<Message>>,
    relay_running: AtomicBool,
    relay_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommunicationBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            mailboxes: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            relay_running: AtomicBool::new(false),
            relay_handle: Mutex::new(None),
        }
    }

    /// Idempotent: a second call for the same id returns the existing pair.
    pub fn register(&self, worker_id: &str) -> Arc<Mailbox> {
        let mut mailboxes = self.mailboxes.write().unwrap();
        mailboxes
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mailbox::new(
                    worker_id.to_string(),
                    self.config.mailbox_capacity,
                ))
            })
            .clone()
    }

    pub fn unregister(&self, worker_id: &str) {
        if let Some(mailbox) = self.mailboxes.write().unwrap().remove(worker_id) {
            mailbox.clear();
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        for members in subscribers.values_mut() {
            members.remove(worker_id);
        }
    }

    pub fn subscribe(&self, worker_id: &str, topic: &str) {
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .insert(worker_id.to_string());
    }

    pub fn unsubscribe(&self, worker_id: &str, topic: &str) {
        if let Some(members) = self.subscribers.lock().unwrap().get_mut(topic) {
            members.remove(worker_id);
        }
    }

    /// Deliver a message to its recipient's inbound mailbox, waiting up to
    /// the configured send budget for space. Returns false if the
    /// recipient is unknown or the mailbox stays full.
    pub async fn send(&self, message: Message) -> bool {
        self.send_timeout(message, self.config.send_timeout).await
    }

    pub async fn send_timeout(&self, message: Message, budget: Duration) -> bool {
        if message.recipient.is_empty() {
            return false;
        }
        let mailbox = {
            let mailboxes = self.mailboxes.read().unwrap();
            match mailboxes.get(&message.recipient) {
                Some(mailbox) => mailbox.clone(),
                None => return false,
            }
        };

        let deadline = Instant::now() + budget;
        loop {
            if mailbox.push_inbound(message.clone()) {
                self.record(message);
                return true;
            }
            if Instant::now() >= deadline {
                log::warn!("mailbox full for {}, dropping message", message.recipient);
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn broadcast(&self, message: Message, exclude_sender: bool) -> usize {
        let targets: Vec<(WorkerId, Arc<Mailbox>)> = {
            let mailboxes = self.mailboxes.read().unwrap();
            mailboxes
                .iter()
                .filter(|(id, _)| !(exclude_sender && **id == message.sender))
                .map(|(id, mb)| (id.clone(), mb.clone()))
                .collect()
        };

        let mut count = 0;
        for (worker_id, mailbox) in targets {
            let mut copy = message.clone();
            copy.recipient = worker_id;
            if mailbox.push_inbound(copy) {
                count += 1;
            }
        }
        self.record(message);
        count
    }

    pub async fn publish(&self, topic: &str, message: Message) -> usize {
        let members: Vec<WorkerId> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .get(topic)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut count = 0;
        for worker_id in members {
            let mailbox = {
                let mailboxes = self.mailboxes.read().unwrap();
                mailboxes.get(&worker_id).cloned()
            };
            let Some(mailbox) = mailbox else { continue };

            let mut copy = message.clone();
            copy.recipient = worker_id;
            copy.payload.insert("topic".to_string(), json!(topic));
            if mailbox.push_inbound(copy) {
                count += 1;
            }
        }
        self.record(message);
        count
    }

    /// Send a request and block (bounded) for the correlated reply.
    /// Returns `None` on timeout or if the send itself fails.
    pub async fn request(&self, mut message: Message, timeout: Duration) -> Option<Message> {
        let correlation = *message
            .correlation_id
            .get_or_insert_with(MessageId::new_v4);
        let requester = message.sender.clone();

        if !self.send(message).await {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let mailbox = {
                let mailboxes = self.mailboxes.read().unwrap();
                mailboxes.get(&requester).cloned()
            }?;
            if let Some(reply) = mailbox.take_correlated(correlation) {
                return Some(reply);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn get(&self, worker_id: &str, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_get(worker_id) {
                return Some(message);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    pub fn try_get(&self, worker_id: &str) -> Option<Message> {
        let mailbox = {
            let mailboxes = self.mailboxes.read().unwrap();
            mailboxes.get(worker_id).cloned()
        }?;
        mailbox.pop_inbound()
    }

    /// Queue a message on the sender's outbound mailbox for the relay
    /// loop to deliver.
    pub fn post_outbound(&self, message: Message) -> bool {
        if message.sender.is_empty() {
            return false;
        }
        let mailbox = {
            let mailboxes = self.mailboxes.read().unwrap();
            mailboxes.get(&message.sender).cloned()
        };
        match mailbox {
            Some(mailbox) => mailbox.push_outbound(message),
            None => false,
        }
    }

    /// Start the background relay that continuously drains every outbound
    /// mailbox and re-enters messages through `send`.
    pub fn start_relay(self: &Arc<Self>) {
        if self.relay_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = self.clone();
        let handle = tokio::spawn(async move {
            while bus.relay_running.load(Ordering::SeqCst) {
                bus.relay_pass().await;
                sleep(POLL_INTERVAL).await;
            }
        });
        *self.relay_handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop_relay(&self) {
        self.relay_running.store(false, Ordering::SeqCst);
        let handle = self.relay_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn relay_pass(&self) {
        let mailboxes: Vec<Arc<Mailbox>> = {
            let map = self.mailboxes.read().unwrap();
            map.values().cloned().collect()
        };
        for mailbox in mailboxes {
            while let Some(message) = mailbox.pop_outbound() {
                if !self.send_timeout(message, POLL_INTERVAL).await {
                    log::warn!("relay dropped message from {}", mailbox.worker_id());
                }
            }
        }
    }

    /// Delivered-message history, newest last.
    pub fn history(
        &self,
        worker_id: Option<&str>,
        kind: Option<MessageKind>,
        limit: usize,
    ) -> Vec<Message> {
        let history = self.history.lock().unwrap();
        let filtered: Vec<Message> = history
            .iter()
            .filter(|m| {
                worker_id.map_or(true, |id| m.sender == id || m.recipient == id)
            })
            .filter(|m| kind.map_or(true, |k| m.kind == k))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub fn queue_sizes(&self) -> HashMap<WorkerId, (usize, usize)> {
        let mailboxes = self.mailboxes.read().unwrap();
        mailboxes
            .iter()
            .map(|(id, mb)| (id.clone(), mb.sizes()))
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            registered_workers: self.mailboxes.read().unwrap().len(),
            topics: self.subscribers.lock().unwrap().len(),
            history_len: self.history.lock().unwrap().len(),
            relay_running: self.relay_running.load(Ordering::SeqCst),
        }
    }

    fn record(&self, message: Message) {
        let mut history = self.history.lock().unwrap();
        history.push_back(message);
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
    }
}
