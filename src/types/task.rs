use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{TaskId, WorkerId};

/// Status of a task in the coordinator.
///
/// `Pending -> Assigned -> Running -> {Completed | Failed | Cancelled}`,
/// with a `Retrying` excursion back into the pending queue when a timeout
/// fires while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Value,
    pub required_capabilities: Vec<String>,
    pub required_tags: Vec<String>,
    pub priority: i32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub assigned_to: Option<WorkerId>,
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    pub context: Value,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: TaskId::new_v4(),
            task_type: task_type.into(),
            payload,
            required_capabilities: Vec::new(),
            required_tags: Vec::new(),
            priority: 0,
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_count: 0,
            created_at: Utc::now(),
            assigned_to: None,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            context: Value::Null,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.required_tags = tags;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<TaskId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// The terminal record of a task execution. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
}

impl TaskResult {
    pub fn completed(task_id: TaskId, worker_id: impl Into<WorkerId>, result: Value) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            worker_id: Some(worker_id.into()),
            started_at: None,
            completed_at: None,
            duration: None,
        }
    }

    pub fn failed(task_id: TaskId, worker_id: Option<WorkerId>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            worker_id,
            started_at: None,
            completed_at: None,
            duration: None,
        }
    }

    pub fn cancelled(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Cancelled,
            result: None,
            error: None,
            worker_id: None,
            started_at: None,
            completed_at: None,
            duration: None,
        }
    }
}
