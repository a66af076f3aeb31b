//! Caller-side view of a submitted task.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use comfyrelay_domain::{ProgressEvent, ServerUrl, TaskId, TaskInfo, TaskStatus};

use crate::error::RelayError;

/// Returned by `submit_task`. Progress events arrive in order; the last one
/// is terminal (`completed` or `error`).
#[derive(Debug)]
pub struct TaskHandle {
    info: TaskInfo,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl TaskHandle {
    pub fn new(info: TaskInfo, events: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        Self { info, events }
    }

    pub fn id(&self) -> &TaskId {
        &self.info.id
    }

    /// Snapshot taken at submission time.
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn bound_server(&self) -> &ServerUrl {
        &self.info.bound_server_url
    }

    /// Next progress event, `None` once the task is retired and drained.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Forward every event to `callback` on a background task.
    pub fn on_progress<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.events.recv().await {
                let terminal = event.is_terminal();
                callback(event);
                if terminal {
                    break;
                }
            }
        })
    }

    /// Wait for the terminal event.
    pub async fn wait(mut self) -> Result<ProgressEvent, RelayError> {
        while let Some(event) = self.events.recv().await {
            match event.status {
                TaskStatus::Completed => return Ok(event),
                TaskStatus::Error => {
                    return Err(RelayError::TaskExecution {
                        task_id: event.task_id,
                        reason: event.error.unwrap_or(event.message),
                    })
                }
                _ => {}
            }
        }
        Err(RelayError::TaskExecution {
            task_id: self.info.id,
            reason: "progress stream closed before the task finished".to_string(),
        })
    }
}
