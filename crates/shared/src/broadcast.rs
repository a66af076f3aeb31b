//! Messages exchanged between windows of the same user over a shared
//! broadcast medium. Delivery is best effort and unordered across windows;
//! these are coordination hints, never a source of truth.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WindowMessage {
    /// A window locked a server.
    LockAcquired {
        window_id: Uuid,
        server_url: String,
        pending_tasks: usize,
    },
    /// A window released its lock.
    LockReleased { window_id: Uuid, server_url: String },
    /// A window's pending task count changed.
    PendingTasks {
        window_id: Uuid,
        server_url: Option<String>,
        count: usize,
    },
    /// A window asks its peers to drop idle locks.
    ResetRequested { window_id: Uuid },

    /// Forward-compatibility fallback for newer variants.
    #[serde(other)]
    Unknown,
}

impl WindowMessage {
    /// Sender of the message, if known.
    pub fn window_id(&self) -> Option<Uuid> {
        match self {
            WindowMessage::LockAcquired { window_id, .. }
            | WindowMessage::LockReleased { window_id, .. }
            | WindowMessage::PendingTasks { window_id, .. }
            | WindowMessage::ResetRequested { window_id } => Some(*window_id),
            WindowMessage::Unknown => None,
        }
    }
}
