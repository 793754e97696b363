use serde::{Deserialize, Serialize};

use docpipe_task::model::Task;

/// Message from a live connection to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start receiving events for one task.
    Subscribe { task_id: String },
    /// Stop receiving events for one task.
    Unsubscribe { task_id: String },
    /// Request cancellation of a running task.
    Cancel { task_id: String },
    Ping,
}

/// Message pushed to a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Handshake acknowledgment with the assigned connection id.
    Connected { connection_id: String },
    Subscribed { task_id: String },
    Unsubscribed { task_id: String },
    /// Durable-record snapshot, sent on subscribe so a reconnecting
    /// client converges even if it missed live events.
    TaskStatus { task: Task },
    TaskProgress {
        task_id: String,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    TaskFailed {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskCancelled { task_id: String },
    Error { message: String },
    Pong,
}
