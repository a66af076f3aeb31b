//! ComfyRelay domain types.
//!
//! Value types shared by every layer: window and task ids, inference server
//! entries with their probe state, and the task lifecycle.

pub mod error;
pub mod ids;
pub mod server;
pub mod task;

pub use error::DomainError;
pub use ids::{TaskId, WindowId};
pub use server::{ProbeOutcome, ProbeRecord, ServerEntry, ServerUrl, UnhealthyReason};
pub use task::{ArtifactRef, ProgressEvent, ResolvedArtifact, TaskInfo, TaskStatus};
