//! ComfyRelay library.
//!
//! Client-side connection and task tracking for a pool of ComfyUI servers.
//!
//! ## Structure
//!
//! - `pool/` - Server registry and health probing
//! - `lock/` - Per-window server lock with reconnect backoff
//! - `tasks/` - Task registry, progress estimation and delivery
//! - `dispatch` - Push frame correlation
//! - `window` - Coordination between windows of one user
//! - `coordinator/` - The facade tying it together
//! - `infrastructure/` - Ports and the HTTP/WebSocket adapters behind them

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod infrastructure;
pub mod lock;
pub mod pool;
pub mod tasks;
pub mod window;

/// Hand-written fakes for unit tests.
#[cfg(test)]
mod test_fixtures;

pub use config::RelayConfig;
pub use coordinator::{RelayCoordinator, RelayDeps, ServerStatus, ServerStatusEntry};
pub use error::RelayError;
pub use tasks::{ProgressSink, SinkError, TaskHandle};
