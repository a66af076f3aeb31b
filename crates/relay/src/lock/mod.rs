//! Server locking and reconnect policy

mod backoff;
mod manager;

pub use backoff::{BackoffState, ReconnectPolicy};
pub use manager::{CloseDisposition, LockActivity, LockInfo, ServerLockManager};
