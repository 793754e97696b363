use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// PENDING → RUNNING → COMPLETED
///                   → FAILED
///                   → CANCELLED
/// ```
///
/// Transitions are monotonic; no transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task — the durable record
// ---------------------------------------------------------------------------

/// A single asynchronous task tracked by the task module.
///
/// The whole record serializes as one flat JSON map under `task:{id}`.
/// Every mutation is a full read-modify-write of the record; the
/// orchestrator is the only writer after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,

    /// Task kind, e.g. `"doc.parse"`, `"doc.generate"`, `"doc.export"`.
    #[serde(rename = "type")]
    pub task_type: String,

    pub status: TaskStatus,

    // --- ownership ---
    pub project_id: String,
    pub tenant_id: String,
    pub user_id: String,

    // --- presentation ---
    pub title: String,
    #[serde(default)]
    pub description: String,

    // --- execution state ---
    /// Progress percentage, 0–100. Non-decreasing while RUNNING.
    #[serde(default)]
    pub progress: u8,
    /// Result payload (set only on COMPLETED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error description (set only on FAILED).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form metadata, opaque to the task module.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    // --- timestamps (RFC 3339) ---
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// TaskEvent — published on the per-task channel
// ---------------------------------------------------------------------------

/// What a [`TaskEvent`] announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress)
    }
}

/// Event published on `task:events:{taskId}` for every progress update
/// and lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

/// Channel a task's events publish on.
pub fn event_channel(task_id: &str) -> String {
    format!("{EVENT_CHANNEL_PREFIX}{task_id}")
}

/// Prefix shared by every per-task event channel; the progress bridge
/// pattern-subscribes to `task:events:*`.
pub const EVENT_CHANNEL_PREFIX: &str = "task:events:";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
