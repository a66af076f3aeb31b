//! Push connection lifecycle.
//!
//! A [`ConnectionHandle`] is the exclusive owner of one live push connection.
//! Only the lock manager holds it; everything else sees the locked server URL.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use comfyrelay_domain::ServerUrl;
use comfyrelay_shared::PushFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected to the server
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Frames are flowing
    Connected,
    /// Handshake failed
    Failed,
}

impl ConnectionState {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Internal helper to update connection state (used by connectors).
pub fn set_connection_state(state_ref: &AtomicU8, new_state: ConnectionState) {
    state_ref.store(new_state.to_u8(), Ordering::SeqCst);
}

/// What a connection reports back to the coordinator's event loop.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Frame { connection_id: u64, frame: PushFrame },
    /// Sent exactly once when the connection's reader stops.
    Closed {
        connection_id: u64,
        server: ServerUrl,
        /// False when the close was requested through [`ConnectionHandle::disconnect`].
        unexpected: bool,
    },
}

/// Handle to one push connection.
///
/// Dropping the handle closes the connection the same way `disconnect` does.
#[derive(Debug)]
pub struct ConnectionHandle {
    connection_id: u64,
    server: ServerUrl,
    state: Arc<AtomicU8>,
    disconnect_tx: Option<oneshot::Sender<()>>,
}

impl ConnectionHandle {
    pub fn new(
        connection_id: u64,
        server: ServerUrl,
        state: Arc<AtomicU8>,
        disconnect_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            connection_id,
            server,
            state,
            disconnect_tx: Some(disconnect_tx),
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn server(&self) -> &ServerUrl {
        &self.server
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Request disconnect. The close notice still arrives on the event channel.
    pub fn disconnect(mut self) {
        if let Some(tx) = self.disconnect_tx.take() {
            let _ = tx.send(());
        }
    }
}
