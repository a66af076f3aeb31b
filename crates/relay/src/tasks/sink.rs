//! Progress sinks and per-task coalescing.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use comfyrelay_domain::{ProgressEvent, TaskId};

use crate::error::RelayError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Receiver of one task's progress events.
pub trait ProgressSink: Send {
    fn deliver(&mut self, event: &ProgressEvent) -> Result<(), SinkError>;
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent) -> Result<(), SinkError> + Send,
{
    fn deliver(&mut self, event: &ProgressEvent) -> Result<(), SinkError> {
        self(event)
    }
}

/// Forwards events into a channel (backs [`crate::TaskHandle`]).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn deliver(&mut self, event: &ProgressEvent) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .map_err(|_| SinkError("task handle dropped".to_string()))
    }
}

/// Rate-limits delivery to one sink: the latest event wins and at most one
/// delivery happens per interval. Terminal events skip the limiter.
///
/// A sink that returns an error or panics is disabled for good.
pub struct CoalescedSink {
    task_id: TaskId,
    sink: Option<Box<dyn ProgressSink>>,
    interval: Duration,
    last_delivery: Option<Instant>,
    pending: Option<ProgressEvent>,
}

impl CoalescedSink {
    pub fn new(task_id: TaskId, sink: Box<dyn ProgressSink>, interval: Duration) -> Self {
        Self {
            task_id,
            sink: Some(sink),
            interval,
            last_delivery: None,
            pending: None,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Follow a task id the server reassigned.
    pub fn rename(&mut self, task_id: TaskId) {
        self.task_id = task_id;
    }

    pub fn offer(&mut self, event: ProgressEvent, now: Instant) {
        if event.is_terminal() {
            self.pending = None;
            self.deliver(&event);
            self.last_delivery = Some(now);
            return;
        }
        self.pending = Some(event);
        self.flush(now);
    }

    /// Deliver the held event if the interval has passed. Returns true if delivered.
    pub fn flush(&mut self, now: Instant) -> bool {
        if self.pending.is_none() {
            return false;
        }
        if let Some(last) = self.last_delivery {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        let Some(event) = self.pending.take() else {
            return false;
        };
        self.deliver(&event);
        self.last_delivery = Some(now);
        true
    }

    fn deliver(&mut self, event: &ProgressEvent) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let failure = match catch_unwind(AssertUnwindSafe(|| sink.deliver(event))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(reason) = failure {
            let err = RelayError::CallbackFailure {
                task_id: self.task_id.clone(),
                reason,
            };
            tracing::warn!("{}; further progress for this task is discarded", err);
            self.sink = None;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
