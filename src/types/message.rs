use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{MessageId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // Lifecycle
    Spawn,
    Init,
    Ready,
    Shutdown,
    Terminate,

    // Task flow
    TaskAssign,
    TaskStart,
    TaskComplete,
    TaskFail,
    TaskRetry,

    // Coordination
    Heartbeat,
    StatusRequest,
    StatusResponse,

    // Data exchange
    DataRequest,
    DataResponse,
    DataPush,

    Error,
}

/// A message on the communication bus. An empty `recipient` means the
/// message is a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub sender: WorkerId,
    pub recipient: WorkerId,
    pub timestamp: DateTime<Utc>,
    pub payload: HashMap<String, Value>,
    pub correlation_id: Option<MessageId>,
    pub reply_to: Option<MessageId>,
}

impl Message {
    pub fn new(kind: MessageKind, sender: impl Into<WorkerId>, recipient: impl Into<WorkerId>) -> Self {
        Self {
            id: MessageId::new_v4(),
            kind,
            sender: sender.into(),
            recipient: recipient.into(),
            timestamp: Utc::now(),
            payload: HashMap::new(),
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn correlated(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn in_reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_empty()
    }

    pub fn to_wire(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_wire(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}
