//! Task tracking: registry, lifecycle, progress delivery

mod handle;
mod progress;
mod registry;
mod sink;

pub use handle::TaskHandle;
pub use progress::ExecutionProgress;
pub use registry::{StatusUpdate, TaskRegistry};
pub use sink::{ChannelSink, CoalescedSink, ProgressSink, SinkError};
