//! Task registry - the tasks this window submitted and has not retired yet

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use comfyrelay_domain::{
    ArtifactRef, ProgressEvent, ResolvedArtifact, ServerUrl, TaskId, TaskInfo, TaskStatus,
};

use super::progress::ExecutionProgress;
use super::sink::{CoalescedSink, ProgressSink};
use crate::error::RelayError;

struct TrackedTask {
    info: TaskInfo,
    sink: CoalescedSink,
    progress: ExecutionProgress,
}

/// Outcome of a status update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    /// Would have moved the task backwards.
    Ignored,
    /// The task reached a terminal state and was removed.
    Retired(TaskInfo),
    UnknownTask,
}

pub struct TaskRegistry {
    tasks: HashMap<TaskId, TrackedTask>,
    progress_interval: Duration,
}

impl TaskRegistry {
    pub fn new(progress_interval: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            progress_interval,
        }
    }

    pub fn set_progress_interval(&mut self, interval: Duration) {
        self.progress_interval = interval;
        for task in self.tasks.values_mut() {
            task.sink.set_interval(interval);
        }
    }

    /// Track a freshly submitted task and deliver its initial `waiting` event.
    pub fn register(
        &mut self,
        info: TaskInfo,
        sink: Box<dyn ProgressSink>,
        total_nodes: usize,
        now: Instant,
    ) -> Result<(), RelayError> {
        if self.tasks.contains_key(&info.id) {
            return Err(RelayError::DuplicateTask(info.id));
        }
        let mut sink = CoalescedSink::new(info.id.clone(), sink, self.progress_interval);
        sink.offer(
            ProgressEvent::new(info.id.clone(), TaskStatus::Waiting, "queued", 0),
            now,
        );
        self.tasks.insert(
            info.id.clone(),
            TrackedTask {
                info,
                sink,
                progress: ExecutionProgress::new(total_nodes),
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskInfo> {
        self.tasks.get(id).map(|t| &t.info)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Stop tracking a task without notifying its sink.
    pub fn remove(&mut self, id: &TaskId) -> Option<TaskInfo> {
        self.tasks.remove(id).map(|t| t.info)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Move a task to the id the server assigned. Returns the updated info, or
    /// `None` when the task already retired or `to` is taken.
    pub fn rekey(&mut self, from: &TaskId, to: TaskId) -> Option<TaskInfo> {
        if self.tasks.contains_key(&to) {
            return None;
        }
        let mut task = self.tasks.remove(from)?;
        task.info.id = to.clone();
        task.sink.rename(to.clone());
        let info = task.info.clone();
        self.tasks.insert(to, task);
        Some(info)
    }

    pub fn progress_mut(&mut self, id: &TaskId) -> Option<&mut ExecutionProgress> {
        self.tasks.get_mut(id).map(|t| &mut t.progress)
    }

    /// Move a task forward and notify its sink.
    ///
    /// Backwards moves are ignored. Terminal states deliver immediately and
    /// remove the task.
    pub fn update_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        message: impl Into<String>,
        percent: u8,
        now: Instant,
    ) -> StatusUpdate {
        let Some(task) = self.tasks.get_mut(id) else {
            return StatusUpdate::UnknownTask;
        };
        if !task.info.status.can_transition_to(status) {
            tracing::debug!(
                "Ignoring {} -> {} for task {}",
                task.info.status,
                status,
                id
            );
            return StatusUpdate::Ignored;
        }

        task.info.status = status;
        task.info.percent = task.info.percent.max(percent.min(100));
        let event = match status {
            TaskStatus::Error => ProgressEvent::failed(id.clone(), message, task.info.percent),
            TaskStatus::Completed => ProgressEvent::new(id.clone(), status, message, 100),
            _ => ProgressEvent::new(id.clone(), status, message, task.info.percent),
        };
        self.deliver(id, event, now)
    }

    /// Advance status and percent without notifying (below the forwarding threshold).
    pub fn record_progress(&mut self, id: &TaskId, status: TaskStatus, percent: u8) -> bool {
        let Some(task) = self.tasks.get_mut(id) else {
            return false;
        };
        if status.is_terminal() || !task.info.status.can_transition_to(status) {
            return false;
        }
        task.info.status = status;
        task.info.percent = task.info.percent.max(percent.min(100));
        true
    }

    /// Complete a task, resolving its outputs against the server it is bound to.
    pub fn complete(
        &mut self,
        id: &TaskId,
        artifacts: &[ArtifactRef],
        message: impl Into<String>,
        now: Instant,
    ) -> StatusUpdate {
        let Some(task) = self.tasks.get_mut(id) else {
            return StatusUpdate::UnknownTask;
        };
        if task.info.status.is_terminal() {
            return StatusUpdate::Ignored;
        }

        let mut resolved = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            match task.info.artifact_url(artifact) {
                Ok(url) => resolved.push(ResolvedArtifact {
                    artifact: artifact.clone(),
                    url,
                }),
                Err(e) => tracing::warn!("Task {}: unusable artifact {}: {}", id, artifact.filename, e),
            }
        }

        task.info.status = TaskStatus::Completed;
        task.info.percent = 100;
        let event =
            ProgressEvent::new(id.clone(), TaskStatus::Completed, message, 100).with_artifacts(resolved);
        self.deliver(id, event, now)
    }

    pub fn fail(&mut self, id: &TaskId, reason: impl Into<String>, now: Instant) -> StatusUpdate {
        self.update_status(id, TaskStatus::Error, reason, 0, now)
    }

    /// Operator escape hatch for a task whose completion frame was lost.
    pub fn force_complete(&mut self, id: &TaskId, now: Instant) -> Result<TaskInfo, RelayError> {
        match self.complete(id, &[], "force completed", now) {
            StatusUpdate::Retired(info) => {
                tracing::info!("Task {} force completed", id);
                Ok(info)
            }
            _ => Err(RelayError::UnknownTask(id.clone())),
        }
    }

    /// Fail every pending task (used when the connection cannot be recovered).
    pub fn fail_all(&mut self, reason: &str, now: Instant) -> Vec<TaskInfo> {
        let mut ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| match self.fail(&id, reason, now) {
                StatusUpdate::Retired(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    /// Deliver coalesced progress whose interval has passed.
    pub fn flush_due(&mut self, now: Instant) -> usize {
        self.tasks
            .values_mut()
            .map(|t| t.sink.flush(now))
            .filter(|delivered| *delivered)
            .count()
    }

    /// Fails with `StaleLockMismatch` when `url` does not target the task's bound server.
    pub fn check_binding(&self, id: &TaskId, url: &str) -> Result<(), RelayError> {
        let info = self
            .get(id)
            .ok_or_else(|| RelayError::UnknownTask(id.clone()))?;
        if targets(&info.bound_server_url, url) {
            Ok(())
        } else {
            Err(RelayError::StaleLockMismatch {
                task_id: id.clone(),
                bound: info.bound_server_url.clone(),
                requested: url.to_string(),
            })
        }
    }

    pub fn artifact_url(&self, id: &TaskId, artifact: &ArtifactRef) -> Result<String, RelayError> {
        let info = self
            .get(id)
            .ok_or_else(|| RelayError::UnknownTask(id.clone()))?;
        Ok(info.artifact_url(artifact)?)
    }

    fn deliver(&mut self, id: &TaskId, event: ProgressEvent, now: Instant) -> StatusUpdate {
        let terminal = event.is_terminal();
        let Some(task) = self.tasks.get_mut(id) else {
            return StatusUpdate::UnknownTask;
        };
        task.sink.offer(event, now);
        if !terminal {
            return StatusUpdate::Applied;
        }
        match self.tasks.remove(id) {
            Some(task) => StatusUpdate::Retired(task.info),
            None => StatusUpdate::UnknownTask,
        }
    }
}

fn targets(server: &ServerUrl, url: &str) -> bool {
    url.strip_prefix(server.as_str())
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
}
