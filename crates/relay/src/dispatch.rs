//! Push-message dispatcher - correlates push frames with tasks and drives
//! their lifecycle.

use tokio::time::Instant;

use comfyrelay_domain::{TaskId, TaskInfo, TaskStatus};
use comfyrelay_shared::PushFrame;

use crate::tasks::{StatusUpdate, TaskRegistry};

/// What a frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not tied to a task (queue status, unknown kinds).
    Ignored,
    /// Correlation id not registered in this window.
    Dropped,
    Updated,
    /// The task reached a terminal state and was removed.
    Retired(TaskInfo),
}

/// Single consumer of the locked connection's frames.
pub struct PushDispatcher {
    near_complete_percent: u8,
    queue_remaining: Option<u32>,
}

impl PushDispatcher {
    pub fn new(near_complete_percent: u8) -> Self {
        Self {
            near_complete_percent,
            queue_remaining: None,
        }
    }

    pub fn set_near_complete_percent(&mut self, percent: u8) {
        self.near_complete_percent = percent;
    }

    /// Server queue depth from the last `status` frame.
    pub fn queue_remaining(&self) -> Option<u32> {
        self.queue_remaining
    }

    pub fn dispatch(
        &mut self,
        frame: PushFrame,
        tasks: &mut TaskRegistry,
        now: Instant,
    ) -> DispatchOutcome {
        let Some(prompt_id) = frame.prompt_id() else {
            if let PushFrame::Status { queue_remaining } = frame {
                self.queue_remaining = queue_remaining;
            } else {
                tracing::trace!("Ignoring push frame of kind {}", frame.kind());
            }
            return DispatchOutcome::Ignored;
        };

        let id = TaskId::new(prompt_id);
        if !tasks.contains(&id) {
            tracing::debug!("Dropping {} frame for unknown task {}", frame.kind(), id);
            return DispatchOutcome::Dropped;
        }

        let update = match frame {
            PushFrame::ExecutionStart { .. } => {
                tasks.update_status(&id, TaskStatus::Executing, "executing", 0, now)
            }
            PushFrame::Executing { node: None, .. } => tasks.complete(&id, &[], "completed", now),
            PushFrame::Executing { node: Some(node), .. } => {
                let waiting = tasks
                    .get(&id)
                    .is_some_and(|t| t.status == TaskStatus::Waiting);
                if let Some(progress) = tasks.progress_mut(&id) {
                    progress.start_node(&node);
                }
                if waiting {
                    tasks.update_status(&id, TaskStatus::Executing, "executing", 0, now)
                } else {
                    self.report_progress(&id, tasks, now)
                }
            }
            PushFrame::ExecutionCached { nodes, .. } => {
                if let Some(progress) = tasks.progress_mut(&id) {
                    progress.mark_cached(&nodes);
                }
                self.report_progress(&id, tasks, now)
            }
            PushFrame::Progress {
                node, value, max, ..
            } => {
                if let Some(progress) = tasks.progress_mut(&id) {
                    progress.set_step(node.as_deref(), value, max);
                }
                self.report_progress(&id, tasks, now)
            }
            PushFrame::ProgressState { nodes, .. } => {
                if let Some(progress) = tasks.progress_mut(&id) {
                    progress.apply_states(&nodes);
                }
                self.report_progress(&id, tasks, now)
            }
            PushFrame::Executed { node, artifacts, .. } => {
                // Single output node: first outputs complete the task.
                tracing::debug!("Task {}: node {} produced {} outputs", id, node, artifacts.len());
                tasks.complete(&id, &artifacts, "completed", now)
            }
            PushFrame::ExecutionSuccess { .. } => tasks.complete(&id, &[], "completed", now),
            PushFrame::ExecutionError {
                message,
                node_id,
                node_type,
                ..
            } => {
                tracing::warn!(
                    "Task {} failed on node {} ({}): {}",
                    id,
                    node_id.as_deref().unwrap_or("?"),
                    node_type.as_deref().unwrap_or("?"),
                    message
                );
                tasks.fail(&id, message, now)
            }
            PushFrame::ExecutionInterrupted { .. } => tasks.fail(&id, "interrupted", now),
            PushFrame::Status { .. } | PushFrame::Unknown { .. } => StatusUpdate::Applied,
        };

        match update {
            StatusUpdate::Retired(info) => DispatchOutcome::Retired(info),
            StatusUpdate::UnknownTask => DispatchOutcome::Dropped,
            StatusUpdate::Applied | StatusUpdate::Ignored => DispatchOutcome::Updated,
        }
    }

    /// Forward the estimate once it passes the near-complete threshold;
    /// below it the task is only updated silently.
    fn report_progress(&self, id: &TaskId, tasks: &mut TaskRegistry, now: Instant) -> StatusUpdate {
        let percent = tasks.progress_mut(id).map(|p| p.percent()).unwrap_or(0);
        if percent > self.near_complete_percent {
            tasks.update_status(
                id,
                TaskStatus::Processing,
                format!("processing {}%", percent),
                percent,
                now,
            )
        } else if tasks.record_progress(id, TaskStatus::Processing, percent) {
            StatusUpdate::Applied
        } else {
            StatusUpdate::Ignored
        }
    }
}
