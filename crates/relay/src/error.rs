//! Errors surfaced at the coordinator boundary

use thiserror::Error;

use comfyrelay_domain::{DomainError, ServerUrl, TaskId};

use crate::infrastructure::ports::SubmitError;

/// Errors returned by [`crate::RelayCoordinator`] and the components it drives.
///
/// Lock-level errors reach the caller of `submit_task`. Task-level errors
/// (`TaskExecution`, `CallbackFailure`) only ever reach the task's own sink
/// or the log.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Every candidate server failed its probe or its push connection.
    #[error("No inference server available ({})", describe_attempts(.attempts))]
    NoServerAvailable { attempts: Vec<(ServerUrl, String)> },

    /// Push connection dropped and could not be re-established.
    #[error("Connection to {server} lost")]
    ConnectionLost { server: ServerUrl },

    /// The inference server reported a failure for one job.
    #[error("Task {task_id} failed: {reason}")]
    TaskExecution { task_id: TaskId, reason: String },

    /// A progress sink failed and was disabled for its task.
    #[error("Progress sink for task {task_id} failed: {reason}")]
    CallbackFailure { task_id: TaskId, reason: String },

    /// A request for a task targeted a server other than the one it is bound to.
    #[error("Task {task_id} is bound to {bound} but a request targeted {requested}")]
    StaleLockMismatch {
        task_id: TaskId,
        bound: ServerUrl,
        requested: String,
    },

    #[error("Submitting to {server} failed: {source}")]
    Submit {
        server: ServerUrl,
        #[source]
        source: SubmitError,
    },

    #[error("Fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: SubmitError,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Task already registered: {0}")]
    DuplicateTask(TaskId),

    #[error("Relay has been shut down")]
    ShutDown,

    #[error("Relay event loop already started")]
    AlreadyStarted,

    #[error(transparent)]
    Domain(#[from] DomainError),
}

fn describe_attempts(attempts: &[(ServerUrl, String)]) -> String {
    if attempts.is_empty() {
        return "no servers configured".to_string();
    }
    attempts
        .iter()
        .map(|(url, reason)| format!("{}: {}", url, reason))
        .collect::<Vec<_>>()
        .join(", ")
}
