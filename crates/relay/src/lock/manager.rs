//! Server lock manager.
//!
//! Owns the one push connection of this window and binds new work to its
//! server until an unlock condition holds:
//!
//! ```text
//! Unlocked --ensure_locked--> Locked --release_lock (idle | force, no tasks)--> Unlocked
//!                               |  \--failures >= threshold, no tasks--> Locked (next server)
//!                               \--connection dropped, tasks pending--> Locked (reconnect, same server)
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use comfyrelay_domain::{ProbeOutcome, ServerEntry, ServerUrl, WindowId};

use crate::error::RelayError;
use crate::infrastructure::connection::{ConnectionEvent, ConnectionHandle};
use crate::infrastructure::ports::{ClockPort, ConnectError, PushConnector};
use crate::pool::{HealthProber, ServerPoolRegistry};

struct LockState {
    locked_server: ServerUrl,
    lock_timestamp: DateTime<Utc>,
    acquired_by: WindowId,
    /// `None` while the connection is down and a reconnect is pending.
    connection: Option<ConnectionHandle>,
}

/// Time of the last activity on the lock. Clones share one clock, so the
/// frame path can record activity without holding the lock manager.
#[derive(Debug, Clone)]
pub struct LockActivity(Arc<StdMutex<Instant>>);

impl LockActivity {
    pub fn new() -> Self {
        Self(Arc::new(StdMutex::new(Instant::now())))
    }

    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }
}

impl Default for LockActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the current lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub server: ServerUrl,
    pub lock_timestamp: DateTime<Utc>,
    pub acquired_by: WindowId,
    pub is_connected: bool,
}

/// What to do after a connection reported that it closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseDisposition {
    /// The close belongs to a connection that is no longer the lock's.
    Stale,
    /// Tasks are bound to the server; reconnect to it.
    Reconnect(ServerUrl),
    /// Nothing was pending; the lock is gone.
    Released(ServerUrl),
}

pub struct ServerLockManager {
    registry: ServerPoolRegistry,
    prober: HealthProber,
    connector: Arc<dyn PushConnector>,
    clock: Arc<dyn ClockPort>,
    window_id: WindowId,
    client_id: String,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    idle_release: Duration,
    activity: LockActivity,
    state: Option<LockState>,
    next_connection_id: u64,
}

impl ServerLockManager {
    pub fn new(
        registry: ServerPoolRegistry,
        prober: HealthProber,
        connector: Arc<dyn PushConnector>,
        clock: Arc<dyn ClockPort>,
        window_id: WindowId,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        idle_release: Duration,
    ) -> Self {
        Self {
            registry,
            prober,
            connector,
            clock,
            window_id,
            client_id: window_id.to_string(),
            events,
            idle_release,
            activity: LockActivity::new(),
            state: None,
            next_connection_id: 0,
        }
    }

    /// Push-connection client id; job submissions must carry the same one.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn set_idle_release(&mut self, idle_release: Duration) {
        self.idle_release = idle_release;
    }

    pub fn locked_server(&self) -> Option<&ServerUrl> {
        self.state.as_ref().map(|s| &s.locked_server)
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .as_ref()
            .and_then(|s| s.connection.as_ref())
            .is_some_and(|c| c.is_connected())
    }

    /// The locked server's pool entry, if a lock is held.
    pub fn current_lock(&self) -> Option<ServerEntry> {
        let state = self.state.as_ref()?;
        Some(
            self.registry
                .get(&state.locked_server)
                .unwrap_or_else(|| ServerEntry::backup(state.locked_server.clone())),
        )
    }

    pub fn lock_info(&self) -> Option<LockInfo> {
        self.state.as_ref().map(|s| LockInfo {
            server: s.locked_server.clone(),
            lock_timestamp: s.lock_timestamp,
            acquired_by: s.acquired_by,
            is_connected: s.connection.as_ref().is_some_and(|c| c.is_connected()),
        })
    }

    /// Shared activity marker consulted by idle release.
    pub fn activity(&self) -> LockActivity {
        self.activity.clone()
    }

    /// Record activity on the lock (submission, inbound frame).
    pub fn touch(&self) {
        self.activity.touch();
    }

    /// Return the locked server, locking one first if needed.
    ///
    /// Idempotent: a live lock is returned as is, without a second connection.
    /// `preferred` (a server a peer window is using) is tried before registry
    /// order when a new server has to be chosen.
    pub async fn ensure_locked(
        &mut self,
        pending: usize,
        preferred: Option<&ServerUrl>,
    ) -> Result<ServerUrl, RelayError> {
        let Some(state) = self.state.as_ref() else {
            return self.acquire(preferred, None).await;
        };
        let server = state.locked_server.clone();
        let connected = state.connection.as_ref().is_some_and(|c| c.is_connected());

        if connected {
            if pending == 0 && self.registry.is_over_threshold(&server) {
                tracing::warn!("Locked server {} is failing, failing over", server);
                self.drop_lock();
                return self.acquire(preferred, Some(&server)).await;
            }
            self.touch();
            return Ok(server);
        }

        // Lock held but the connection is gone: same server first.
        match self.connect(&server).await {
            Ok(handle) => {
                self.reattach(handle);
                Ok(server)
            }
            Err(e) if pending > 0 => {
                tracing::warn!("Locked server {} unreachable with {} tasks pending: {}", server, pending, e);
                Err(RelayError::ConnectionLost { server })
            }
            Err(e) => {
                tracing::warn!("Locked server {} unreachable, choosing another: {}", server, e);
                self.registry.mark_failure(&server);
                self.drop_lock();
                self.acquire(preferred, Some(&server)).await
            }
        }
    }

    /// Pick the first healthy server (probing in order) and connect to it.
    async fn acquire(
        &mut self,
        preferred: Option<&ServerUrl>,
        skip: Option<&ServerUrl>,
    ) -> Result<ServerUrl, RelayError> {
        let mut candidates = self.registry.failover_order(skip);
        if let Some(preferred) = preferred {
            if let Some(pos) = candidates.iter().position(|url| url == preferred) {
                let url = candidates.remove(pos);
                candidates.insert(0, url);
            }
        }

        let mut attempts: Vec<(ServerUrl, String)> = Vec::new();
        if let Some(skipped) = skip {
            attempts.push((skipped.clone(), "skipped after repeated failures".to_string()));
        }

        for url in candidates {
            if let ProbeOutcome::Unhealthy(reason) = self.prober.probe_and_record(&url).await {
                tracing::info!("Skipping {}: {}", url, reason);
                attempts.push((url, reason.to_string()));
                continue;
            }
            match self.connect(&url).await {
                Ok(handle) => {
                    self.install(url.clone(), handle);
                    return Ok(url);
                }
                Err(e) => {
                    tracing::warn!("Server {} is healthy but its push connection failed: {}", url, e);
                    self.registry.mark_failure(&url);
                    attempts.push((url, e.to_string()));
                }
            }
        }

        tracing::error!("No inference server available ({} candidates tried)", attempts.len());
        Err(RelayError::NoServerAvailable { attempts })
    }

    async fn connect(&mut self, url: &ServerUrl) -> Result<ConnectionHandle, ConnectError> {
        self.next_connection_id += 1;
        self.connector
            .connect(url, &self.client_id, self.next_connection_id, self.events.clone())
            .await
    }

    fn install(&mut self, server: ServerUrl, handle: ConnectionHandle) {
        tracing::info!(
            "Locked server {} (connection #{})",
            server,
            handle.connection_id()
        );
        self.state = Some(LockState {
            locked_server: server,
            lock_timestamp: self.clock.now(),
            acquired_by: self.window_id,
            connection: Some(handle),
        });
        self.activity.touch();
    }

    /// Put a fresh connection under the existing lock (reconnect keeps the timestamp).
    fn reattach(&mut self, handle: ConnectionHandle) {
        if let Some(state) = self.state.as_mut() {
            tracing::info!(
                "Reconnected to {} (connection #{})",
                state.locked_server,
                handle.connection_id()
            );
            if let Some(old) = state.connection.replace(handle) {
                old.disconnect();
            }
            self.activity.touch();
        }
    }

    /// Release the lock if nothing is pending and it is idle (or `force`).
    ///
    /// `force` only waives the idle requirement; a lock with pending tasks
    /// is never released here.
    pub fn release_lock(&mut self, force: bool, pending: usize) -> bool {
        let Some(state) = self.state.as_ref() else {
            return false;
        };
        if pending > 0 {
            tracing::debug!(
                "Not releasing {}: {} tasks pending",
                state.locked_server,
                pending
            );
            return false;
        }
        if !force && self.activity.idle_for() < self.idle_release {
            return false;
        }
        self.drop_lock().is_some()
    }

    /// Unconditionally drop the lock and close its connection.
    pub fn drop_lock(&mut self) -> Option<ServerUrl> {
        let state = self.state.take()?;
        if let Some(connection) = state.connection {
            connection.disconnect();
        }
        tracing::info!("Released lock on {}", state.locked_server);
        Some(state.locked_server)
    }

    /// React to a connection's close notice.
    pub fn handle_closed(&mut self, connection_id: u64, pending: usize) -> CloseDisposition {
        let Some(state) = self.state.as_mut() else {
            return CloseDisposition::Stale;
        };
        let is_current = state
            .connection
            .as_ref()
            .is_some_and(|c| c.connection_id() == connection_id);
        if !is_current {
            return CloseDisposition::Stale;
        }

        state.connection = None;
        let server = state.locked_server.clone();
        if pending > 0 {
            tracing::warn!(
                "Connection to {} dropped with {} tasks pending, reconnecting",
                server,
                pending
            );
            CloseDisposition::Reconnect(server)
        } else {
            self.drop_lock();
            CloseDisposition::Released(server)
        }
    }

    /// Whether the lock on `server` is waiting for a reconnect.
    pub fn needs_reconnect(&self, server: &ServerUrl) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| &s.locked_server == server && s.connection.is_none())
    }

    /// One reconnect attempt to the locked server.
    pub async fn reconnect(&mut self) -> Result<(), RelayError> {
        let Some(server) = self.locked_server().cloned() else {
            return Ok(());
        };
        match self.connect(&server).await {
            Ok(handle) => {
                self.reattach(handle);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Reconnect to {} failed: {}", server, e);
                Err(RelayError::ConnectionLost { server })
            }
        }
    }

    /// Move off a failing server when nothing is bound to it.
    ///
    /// Returns the new server, or `None` when no failover was needed or allowed.
    pub async fn fail_over(
        &mut self,
        pending: usize,
        preferred: Option<&ServerUrl>,
    ) -> Result<Option<ServerUrl>, RelayError> {
        let Some(server) = self.locked_server().cloned() else {
            return Ok(None);
        };
        if pending > 0 || !self.registry.is_over_threshold(&server) {
            return Ok(None);
        }
        tracing::warn!("Failing over from {}", server);
        self.drop_lock();
        self.acquire(preferred, Some(&server)).await.map(Some)
    }

    /// Move back to the primary when it is healthy again and nothing is pending.
    pub async fn try_return_to_primary(&mut self, pending: usize) -> bool {
        let Some(current) = self.locked_server().cloned() else {
            return false;
        };
        let Some(primary) = self.registry.primary() else {
            return false;
        };
        if primary.url == current || pending > 0 {
            return false;
        }
        if !self.prober.probe_and_record(&primary.url).await.is_healthy() {
            return false;
        }
        match self.connect(&primary.url).await {
            Ok(handle) => {
                tracing::info!("Primary {} is healthy again, moving off {}", primary.url, current);
                self.drop_lock();
                self.install(primary.url, handle);
                true
            }
            Err(e) => {
                tracing::warn!("Primary {} probed healthy but connect failed: {}", primary.url, e);
                self.registry.mark_failure(&primary.url);
                false
            }
        }
    }
}
