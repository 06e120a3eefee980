use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{Message, MessageKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub input_kinds: Vec<String>,
    pub output_kinds: Vec<String>,
}

impl Capability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_kinds: Vec::new(),
            output_kinds: Vec::new(),
        }
    }

    pub fn with_input_kinds(mut self, kinds: Vec<String>) -> Self {
        self.input_kinds = kinds;
        self
    }

    pub fn with_output_kinds(mut self, kinds: Vec<String>) -> Self {
        self.output_kinds = kinds;
        self
    }

    pub fn accepts(&self, input_kind: &str) -> bool {
        self.input_kinds.iter().any(|k| k == input_kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: Vec<String>,
}

/// Status cell a worker embeds so the default dispatcher can track
/// counters and heartbeats.
pub struct StatusHandle {
    inner: Mutex<WorkerStatus>,
}

impl StatusHandle {
    pub fn new(worker_id: impl Into<String>, capabilities: &[Capability]) -> Self {
        Self {
            inner: Mutex::new(WorkerStatus {
                worker_id: worker_id.into(),
                current_task: None,
                tasks_completed: 0,
                tasks_failed: 0,
                last_heartbeat: Utc::now(),
                capabilities: capabilities.iter().map(|c| c.name.clone()).collect(),
            }),
        }
    }

    pub fn snapshot(&self) -> WorkerStatus {
        self.inner.lock().unwrap().clone()
    }

    pub fn touch_heartbeat(&self) {
        self.inner.lock().unwrap().last_heartbeat = Utc::now();
    }

    pub fn task_started(&self, task_id: impl Into<String>) {
        self.inner.lock().unwrap().current_task = Some(task_id.into());
    }

    pub fn task_finished(&self, success: bool) {
        let mut status = self.inner.lock().unwrap();
        status.current_task = None;
        if success {
            status.tasks_completed += 1;
        } else {
            status.tasks_failed += 1;
        }
    }
}

/// The contract every worker implements.
///
/// `initialize` failure aborts the spawn; `shutdown` failure forces the
/// instance through error into termination; `execute` failure surfaces as
/// a task-failure message, never as an uncaught fault. Each assignment
/// produces exactly one correlated completion or failure reply.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn status(&self) -> &StatusHandle;

    async fn initialize(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn execute(&self, payload: Value, context: Value) -> Result<Value>;

    fn has_capability(&self, name: &str) -> bool {
        self.capabilities().iter().any(|c| c.name == name)
    }

    fn can_accept(&self, input_kind: &str) -> bool {
        self.capabilities().iter().any(|c| c.accepts(input_kind))
    }

    /// Dispatch an incoming message by kind. Unhandled kinds yield no
    /// reply. Implementations may override for custom protocols.
    async fn handle_message(&self, message: Message) -> Option<Message> {
        match message.kind {
            MessageKind::Heartbeat => {
                self.status().touch_heartbeat();
                Some(self.status_reply(&message))
            }
            MessageKind::StatusRequest => Some(self.status_reply(&message)),
            MessageKind::TaskAssign => Some(self.run_assignment(message).await),
            _ => None,
        }
    }

    fn status_reply(&self, request: &Message) -> Message {
        let snapshot = self.status().snapshot();
        Message::new(MessageKind::StatusResponse, self.id(), request.sender.clone())
            .with_payload(
                "status",
                serde_json::to_value(&snapshot).unwrap_or(Value::Null),
            )
            .correlated(request.correlation_id.unwrap_or(request.id))
            .in_reply_to(request.id)
    }

    /// Run a task assignment end to end, producing exactly one correlated
    /// completion or failure message.
    async fn run_assignment(&self, message: Message) -> Message {
        let task = message.payload.get("task").cloned().unwrap_or(Value::Null);
        let context = message
            .payload
            .get("context")
            .cloned()
            .unwrap_or(Value::Null);
        let task_id = task.get("id").cloned().unwrap_or(Value::Null);
        let payload = task.get("payload").cloned().unwrap_or(Value::Null);
        let correlation = message.correlation_id.unwrap_or(message.id);

        if let Some(id) = task_id.as_str() {
            self.status().task_started(id);
        }

        match self.execute(payload, context).await {
            Ok(result) => {
                self.status().task_finished(true);
                Message::new(MessageKind::TaskComplete, self.id(), message.sender)
                    .with_payload("task_id", task_id)
                    .with_payload("result", result)
                    .with_payload("status", json!("success"))
                    .correlated(correlation)
            }
            Err(error) => {
                self.status().task_finished(false);
                Message::new(MessageKind::TaskFail, self.id(), message.sender)
                    .with_payload("task_id", task_id)
                    .with_payload("error", json!(error.to_string()))
                    .with_payload("status", json!("failed"))
                    .correlated(correlation)
            }
        }
    }
}
