//! Cross-window coordination.
//!
//! Each process is one "window" with a random id. Windows announce their
//! lock state on a shared broadcast medium and watch each other's
//! announcements, but never act on a peer's lock: the only reaction to a
//! peer is releasing our own idle lock when asked to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use comfyrelay_domain::{ServerUrl, TaskId, WindowId};
use comfyrelay_shared::WindowMessage;

use crate::infrastructure::ports::BroadcastPort;

/// Last known lock of a peer window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLock {
    pub server: ServerUrl,
    pub pending_tasks: usize,
    pub seen_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    None,
    /// A peer asked every window to drop its idle lock.
    ReleaseRequested,
}

pub struct WindowCoordinator {
    window_id: WindowId,
    broadcast: Arc<dyn BroadcastPort>,
    peers: HashMap<WindowId, PeerLock>,
    /// Peers silent for longer than this are forgotten.
    peer_ttl: Duration,
    /// Our lock as last announced.
    announced: Option<ServerUrl>,
}

impl WindowCoordinator {
    pub fn new(window_id: WindowId, broadcast: Arc<dyn BroadcastPort>, peer_ttl: Duration) -> Self {
        Self {
            window_id,
            broadcast,
            peers: HashMap::new(),
            peer_ttl,
            announced: None,
        }
    }

    pub fn set_peer_ttl(&mut self, peer_ttl: Duration) {
        self.peer_ttl = peer_ttl;
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    /// Fresh task id namespaced by this window.
    pub fn new_task_id(&self) -> TaskId {
        TaskId::for_window(self.window_id)
    }

    /// Announce a change of our lock. A move announces the release first.
    /// Nothing is published when `current` matches the last announcement.
    pub fn sync_lock(&mut self, current: Option<&ServerUrl>, pending_tasks: usize) {
        if self.announced.as_ref() == current {
            return;
        }
        if let Some(old) = self.announced.take() {
            self.broadcast.publish(WindowMessage::LockReleased {
                window_id: *self.window_id.as_uuid(),
                server_url: old.to_string(),
            });
        }
        if let Some(server) = current {
            self.broadcast.publish(WindowMessage::LockAcquired {
                window_id: *self.window_id.as_uuid(),
                server_url: server.to_string(),
                pending_tasks,
            });
            self.announced = Some(server.clone());
        }
    }

    pub fn announce_pending(&self, count: usize) {
        self.broadcast.publish(WindowMessage::PendingTasks {
            window_id: *self.window_id.as_uuid(),
            server_url: self.announced.as_ref().map(|s| s.to_string()),
            count,
        });
    }

    pub fn request_reset(&self) {
        self.broadcast.publish(WindowMessage::ResetRequested {
            window_id: *self.window_id.as_uuid(),
        });
    }

    /// Update peer bookkeeping from one message. Our own echoes are ignored.
    pub fn observe(&mut self, message: WindowMessage, now: Instant) -> PeerAction {
        let ttl = self.peer_ttl;
        self.peers
            .retain(|_, peer| now.saturating_duration_since(peer.seen_at) < ttl);

        let Some(sender) = message.window_id().map(WindowId::from_uuid) else {
            return PeerAction::None;
        };
        if sender == self.window_id {
            return PeerAction::None;
        }

        match message {
            WindowMessage::LockAcquired {
                server_url,
                pending_tasks,
                ..
            } => match ServerUrl::parse(&server_url) {
                Ok(server) => {
                    tracing::debug!(
                        "Window {} locked {} ({} pending)",
                        sender.short(),
                        server,
                        pending_tasks
                    );
                    self.peers.insert(
                        sender,
                        PeerLock {
                            server,
                            pending_tasks,
                            seen_at: now,
                        },
                    );
                }
                Err(e) => tracing::debug!("Ignoring peer lock with bad url: {}", e),
            },
            WindowMessage::LockReleased { .. } => {
                self.peers.remove(&sender);
            }
            WindowMessage::PendingTasks {
                server_url, count, ..
            } => {
                let server = server_url.and_then(|s| ServerUrl::parse(&s).ok());
                match (self.peers.get_mut(&sender), server) {
                    (Some(peer), _) => {
                        peer.pending_tasks = count;
                        peer.seen_at = now;
                    }
                    (None, Some(server)) => {
                        self.peers.insert(
                            sender,
                            PeerLock {
                                server,
                                pending_tasks: count,
                                seen_at: now,
                            },
                        );
                    }
                    (None, None) => {}
                }
            }
            WindowMessage::ResetRequested { .. } => {
                tracing::info!("Window {} requested a lock reset", sender.short());
                return PeerAction::ReleaseRequested;
            }
            WindowMessage::Unknown => {}
        }
        PeerAction::None
    }

    /// Server most recently locked by a live peer, used as the first
    /// candidate so one user's windows share a GPU. Peers with pending
    /// tasks win over idle ones.
    pub fn preferred_server(&self, now: Instant) -> Option<ServerUrl> {
        self.peers
            .values()
            .filter(|p| now.saturating_duration_since(p.seen_at) < self.peer_ttl)
            .max_by_key(|p| (p.pending_tasks > 0, p.seen_at))
            .map(|p| p.server.clone())
    }
}
