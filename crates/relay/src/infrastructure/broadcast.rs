//! Window broadcast implementations.

use tokio::sync::broadcast;

use comfyrelay_shared::WindowMessage;

use super::ports::BroadcastPort;

/// In-process medium. Clones share one channel, so every coordinator built
/// from a clone sees the others' announcements (and its own).
#[derive(Clone)]
pub struct LocalBroadcast {
    tx: broadcast::Sender<WindowMessage>,
}

impl LocalBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(64)
    }
}

impl BroadcastPort for LocalBroadcast {
    fn publish(&self, message: WindowMessage) {
        // No subscribers is not an error
        if self.tx.send(message).is_err() {
            tracing::trace!("Window broadcast has no subscribers");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.tx.subscribe()
    }
}

/// Single-window deployments: publishes go nowhere, subscriptions are closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroadcast;

impl BroadcastPort for NoopBroadcast {
    fn publish(&self, _message: WindowMessage) {}

    fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        let (_tx, rx) = broadcast::channel(1);
        rx
    }
}
