//! Row types and status enums for the task store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assessing,
    Executing,
    Decomposed,
    ReadyForReview,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assessing => "assessing",
            Self::Executing => "executing",
            Self::Decomposed => "decomposed",
            Self::ReadyForReview => "ready_for_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "assessing" => Some(Self::Assessing),
            "executing" => Some(Self::Executing),
            "decomposed" => Some(Self::Decomposed),
            "ready_for_review" => Some(Self::ReadyForReview),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are never left again (failed may be retried via
    /// an explicit metadata bump, which moves the task back to pending).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Decomposed | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// A session that still counts against the concurrency cap.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub uuid: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub position: i64,
    pub parent_task_id: Option<i64>,
    pub project_id: Option<i64>,
    pub complexity: Option<String>,
    pub recommended_model: Option<String>,
    pub active_session_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

impl Task {
    /// Typed view of the recognized metadata keys.
    pub fn meta(&self) -> TaskMeta {
        TaskMeta::from_map(&self.metadata)
    }
}

/// Typed view over the task metadata bag. Unknown keys pass through
/// untouched on the task itself; this view only decodes the keys the
/// scheduler acts on.
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    pub active: bool,
    pub decompose_on_heartbeat: bool,
    pub retry_count: i64,
    pub error: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub pr_url: Option<String>,
    pub assessment: Option<Value>,
    pub decomposed_into: Vec<i64>,
}

impl TaskMeta {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            active: map.get("active").and_then(Value::as_bool).unwrap_or(false),
            decompose_on_heartbeat: map
                .get("decompose_on_heartbeat")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            retry_count: map
                .get("retry_count")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            error: map
                .get("error")
                .and_then(Value::as_str)
                .map(String::from),
            branch: map
                .get("branch")
                .and_then(Value::as_str)
                .map(String::from),
            worktree_path: map
                .get("worktree_path")
                .and_then(Value::as_str)
                .map(String::from),
            pr_url: map
                .get("pr_url")
                .and_then(Value::as_str)
                .map(String::from),
            assessment: map.get("assessment").cloned(),
            decomposed_into: map
                .get("decomposed_into")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default(),
        }
    }

    /// Whether the assessment recommended splitting into subtasks.
    pub fn should_decompose(&self) -> bool {
        self.assessment
            .as_ref()
            .and_then(|a| a.get("should_decompose"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Subtask titles proposed by the assessment.
    pub fn subtasks(&self) -> Vec<String> {
        self.assessment
            .as_ref()
            .and_then(|a| a.get("subtasks"))
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fields for creating a task. Position is assigned by the store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskCreate {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub parent_task_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Partial task update. `None` fields are left untouched; metadata is
/// merged shallowly with `null` values deleting keys.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    /// Status moves only through the scheduler or the dedicated status
    /// operation, never through a generic patch.
    #[serde(skip)]
    pub status: Option<TaskStatus>,
    pub priority: Option<i64>,
    pub position: Option<i64>,
    pub complexity: Option<String>,
    pub recommended_model: Option<String>,
    /// `Some(None)` clears the active session.
    #[serde(skip)]
    pub active_session_id: Option<Option<i64>>,
    #[serde(skip)]
    pub started_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip)]
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub metadata: Option<Map<String, Value>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn metadata(patch: Map<String, Value>) -> Self {
        Self {
            metadata: Some(patch),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub uuid: String,
    pub task_id: i64,
    pub claude_session_id: Option<String>,
    pub working_directory: String,
    pub model: String,
    pub status: SessionStatus,
    pub turn_count: i64,
    pub stdout_path: String,
    pub stderr_path: String,
    pub pid: Option<i64>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub artifacts: Map<String, Value>,
}

/// Partial session update.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub turn_count: Option<i64>,
    pub pid: Option<i64>,
    pub exit_code: Option<i64>,
    pub claude_session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub artifacts: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub uuid: String,
    pub task_id: i64,
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub uuid: String,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Singleton snapshot of the agent CLI's usage state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub tier: Option<String>,
    pub messages_used: i64,
    pub messages_limit: i64,
    pub percent_used: f64,
    pub is_limited: bool,
    pub reset_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub working_directory: String,
    /// Remote origin in `owner/repo` form; empty means no git integration.
    pub git_repo: String,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCreate {
    pub name: String,
    pub working_directory: String,
    #[serde(default)]
    pub git_repo: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_status_round_trip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Assessing,
            TaskStatus::Executing,
            TaskStatus::Decomposed,
            TaskStatus::ReadyForReview,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Decomposed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::ReadyForReview.is_terminal());
    }

    #[test]
    fn session_live_statuses() {
        assert!(SessionStatus::Created.is_live());
        assert!(SessionStatus::Running.is_live());
        assert!(!SessionStatus::Completed.is_live());
        assert!(!SessionStatus::Cancelled.is_live());
    }

    #[test]
    fn task_meta_reads_recognized_keys() {
        let map = json!({
            "active": true,
            "retry_count": 2,
            "branch": "task-1-fix",
            "assessment": {
                "should_decompose": true,
                "subtasks": ["a", "b"],
            },
            "unrecognized": "passes through",
        });
        let meta = TaskMeta::from_map(map.as_object().unwrap());
        assert!(meta.active);
        assert_eq!(meta.retry_count, 2);
        assert_eq!(meta.branch.as_deref(), Some("task-1-fix"));
        assert!(meta.should_decompose());
        assert_eq!(meta.subtasks(), vec!["a", "b"]);
    }

    #[test]
    fn task_meta_defaults_on_empty_bag() {
        let meta = TaskMeta::from_map(&Map::new());
        assert!(!meta.active);
        assert_eq!(meta.retry_count, 0);
        assert!(!meta.should_decompose());
        assert!(meta.subtasks().is_empty());
    }

    #[test]
    fn task_serializes_snake_case_status() {
        let json = serde_json::to_string(&TaskStatus::ReadyForReview).unwrap();
        assert_eq!(json, "\"ready_for_review\"");
    }

    #[test]
    fn task_patch_does_not_accept_status_from_json() {
        let patch: TaskPatch =
            serde_json::from_str(r#"{"status": "executing", "priority": 5}"#).unwrap();
        assert!(patch.status.is_none(), "status key is ignored on the wire");
        assert_eq!(patch.priority, Some(5));
    }
}
