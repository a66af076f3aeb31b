//! Task entity - one submitted job tracked from submission to a terminal state

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{DomainError, ServerUrl, TaskId, WindowId};

/// Lifecycle of a task.
///
/// `Waiting -> Executing -> Processing -> Completed`, with `Error` reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Executing,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Waiting => 0,
            TaskStatus::Executing => 1,
            TaskStatus::Processing => 2,
            TaskStatus::Completed | TaskStatus::Error => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    /// Forward-only check. Staying in the same non-terminal state is allowed
    /// (repeated progress frames), leaving a terminal state is not.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == TaskStatus::Error {
            return true;
        }
        next.rank() >= self.rank()
    }

    pub fn transition(self, next: TaskStatus) -> Result<TaskStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidStateTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Executing => "executing",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Server-relative reference to an output file, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl ArtifactRef {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            subfolder: String::new(),
            folder_type: default_folder_type(),
        }
    }

    /// Fetch URL for this artifact on `server`.
    ///
    /// Callers must pass the task's bound server, never the currently locked one.
    pub fn url_on(&self, server: &ServerUrl) -> Result<String, DomainError> {
        let mut url = Url::parse(&server.endpoint("view"))
            .map_err(|e| DomainError::invalid_url(server.as_str(), e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("filename", &self.filename)
            .append_pair("subfolder", &self.subfolder)
            .append_pair("type", &self.folder_type);
        Ok(url.into())
    }
}

/// Artifact resolved against the server that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    pub artifact: ArtifactRef,
    pub url: String,
}

/// Snapshot of a tracked task (everything except its progress sink).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: TaskId,
    /// Which pipeline was invoked (undress, faceswap, ...). Only used for logs.
    pub workflow_type: String,
    /// Frozen at submission time.
    pub bound_server_url: ServerUrl,
    pub status: TaskStatus,
    /// Highest percent reported so far.
    pub percent: u8,
    pub created_at: DateTime<Utc>,
    pub window_id: WindowId,
}

impl TaskInfo {
    pub fn new(
        id: TaskId,
        workflow_type: impl Into<String>,
        bound_server_url: ServerUrl,
        window_id: WindowId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_type: workflow_type.into(),
            bound_server_url,
            status: TaskStatus::Waiting,
            percent: 0,
            created_at: now,
            window_id,
        }
    }

    /// Resolve an artifact of this task. Always uses the bound server.
    pub fn artifact_url(&self, artifact: &ArtifactRef) -> Result<String, DomainError> {
        artifact.url_on(&self.bound_server_url)
    }
}

/// One progress notification delivered to a task's sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub message: String,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ResolvedArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, status: TaskStatus, message: impl Into<String>, percent: u8) -> Self {
        Self {
            task_id,
            status,
            message: message.into(),
            percent: percent.min(100),
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn failed(task_id: TaskId, reason: impl Into<String>, percent: u8) -> Self {
        let reason = reason.into();
        Self {
            task_id,
            status: TaskStatus::Error,
            message: format!("failed: {}", reason),
            percent: percent.min(100),
            artifacts: Vec::new(),
            error: Some(reason),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ResolvedArtifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
