//! Relay coordinator - the one object a client process constructs.
//!
//! Owns the lock manager and the task-side state (registry, dispatcher,
//! window coordinator) behind two async mutexes, and runs the event loop
//! that feeds them: push frames, connection close notices, the progress
//! tick, the optional health sweep and peer window messages.
//!
//! Lock order is lock manager first, then task state. The task state is
//! never held across a network call, so frames keep flowing while a submit
//! or a connect is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use comfyrelay_domain::{
    ArtifactRef, ProbeOutcome, ResolvedArtifact, ServerUrl, TaskId, TaskInfo, TaskStatus, WindowId,
};
use comfyrelay_shared::{PushFrame, QueuePromptRequest, WindowMessage};

use crate::config::RelayConfig;
use crate::dispatch::{DispatchOutcome, PushDispatcher};
use crate::error::RelayError;
use crate::infrastructure::connection::ConnectionEvent;
use crate::infrastructure::ports::{
    BroadcastPort, ClockPort, InferenceServerPort, PushConnector, SubmitError,
};
use crate::infrastructure::{ComfyUIClient, NoopBroadcast, SystemClock, WebSocketConnector};
use crate::lock::{
    BackoffState, CloseDisposition, LockActivity, ReconnectPolicy, ServerLockManager,
};
use crate::pool::{HealthProber, ServerPoolRegistry};
use crate::tasks::{ChannelSink, ProgressSink, TaskHandle, TaskRegistry};
use crate::window::{PeerAction, WindowCoordinator};

/// External collaborators of the coordinator.
pub struct RelayDeps {
    pub server_api: Arc<dyn InferenceServerPort>,
    pub connector: Arc<dyn PushConnector>,
    pub broadcast: Arc<dyn BroadcastPort>,
    pub clock: Arc<dyn ClockPort>,
}

impl RelayDeps {
    /// ComfyUI over HTTP and WebSocket, single window.
    pub fn production(config: &RelayConfig) -> Self {
        Self {
            server_api: Arc::new(ComfyUIClient::new(config.submit_timeout())),
            connector: Arc::new(WebSocketConnector::new(config.health_timeout())),
            broadcast: Arc::new(NoopBroadcast),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

/// Read-only diagnostic snapshot of this window's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub locked_server: Option<ServerUrl>,
    pub is_connected: bool,
    pub pending_task_count: usize,
    pub lock_timestamp: Option<DateTime<Utc>>,
    pub window_id: WindowId,
    pub queue_remaining: Option<u32>,
}

/// One row of [`RelayCoordinator::list_all_server_statuses`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusEntry {
    pub url: ServerUrl,
    pub healthy: bool,
    pub is_active: bool,
    pub is_primary: bool,
    pub failure_count: u32,
}

/// Task-side state. Never held across a network call.
struct CoreState {
    config: RelayConfig,
    tasks: TaskRegistry,
    dispatcher: PushDispatcher,
    window: WindowCoordinator,
}

impl CoreState {
    fn sync_lock(&mut self, current: Option<&ServerUrl>) {
        let pending = self.tasks.pending_count();
        self.window.sync_lock(current, pending);
    }

    fn announce_pending(&self) {
        self.window.announce_pending(self.tasks.pending_count());
    }

    fn pending_and_preferred(&self) -> (usize, Option<ServerUrl>) {
        (
            self.tasks.pending_count(),
            self.window.preferred_server(Instant::now()),
        )
    }
}

struct Shared {
    /// Lock manager. May be held across probes and connects; always taken
    /// before `core` when both are needed.
    lock: Mutex<ServerLockManager>,
    core: Mutex<CoreState>,
    activity: LockActivity,
    reconnecting: AtomicBool,
    registry: ServerPoolRegistry,
    prober: HealthProber,
    server_api: Arc<dyn InferenceServerPort>,
    broadcast: Arc<dyn BroadcastPort>,
    clock: Arc<dyn ClockPort>,
    window_id: WindowId,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    shutdown: CancellationToken,
}

/// Connection and task-tracking coordinator for one client window.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct RelayCoordinator {
    inner: Arc<Shared>,
}

impl RelayCoordinator {
    pub fn new(config: RelayConfig, deps: RelayDeps) -> Result<Self, RelayError> {
        config.validate()?;
        let (primary, backups) = config.server_urls()?;

        let registry = ServerPoolRegistry::new(primary, backups, config.switch_threshold);
        let prober = HealthProber::new(
            Arc::clone(&deps.server_api),
            registry.clone(),
            Arc::clone(&deps.clock),
            config.health_timeout(),
        );
        let window_id = WindowId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let lock = ServerLockManager::new(
            registry.clone(),
            prober.clone(),
            deps.connector,
            Arc::clone(&deps.clock),
            window_id,
            events_tx,
            config.idle_release(),
        );
        let activity = lock.activity();
        let core = CoreState {
            tasks: TaskRegistry::new(config.progress_interval()),
            dispatcher: PushDispatcher::new(config.near_complete_percent),
            window: WindowCoordinator::new(
                window_id,
                Arc::clone(&deps.broadcast),
                config.idle_release(),
            ),
            config,
        };

        tracing::info!("Relay window {} ready", window_id.short());

        Ok(Self {
            inner: Arc::new(Shared {
                lock: Mutex::new(lock),
                core: Mutex::new(core),
                activity,
                reconnecting: AtomicBool::new(false),
                registry,
                prober,
                server_api: deps.server_api,
                broadcast: deps.broadcast,
                clock: deps.clock,
                window_id,
                events_rx: StdMutex::new(Some(events_rx)),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn window_id(&self) -> WindowId {
        self.inner.window_id
    }

    pub fn registry(&self) -> &ServerPoolRegistry {
        &self.inner.registry
    }

    /// Spawn the event loop. Can only be started once.
    pub fn start(&self) -> Result<JoinHandle<()>, RelayError> {
        let events = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(RelayError::AlreadyStarted)?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run(events).await }))
    }

    /// Frames are dispatched inline. Anything that needs the lock manager
    /// runs on its own task so a slow connect never holds up dispatch.
    async fn run(self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tick_every, sweep_every) = {
            let core = self.inner.core.lock().await;
            (
                core.config.progress_interval(),
                core.config.health_sweep_interval(),
            )
        };
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = sweep_every.map(|every| {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let mut peers = Some(self.inner.broadcast.subscribe());

        tracing::info!("Relay event loop started");
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(ConnectionEvent::Frame { frame, .. }) => self.handle_frame(frame).await,
                    Some(ConnectionEvent::Closed { connection_id, unexpected, .. }) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.handle_closed(connection_id, unexpected).await;
                        });
                    }
                    None => break,
                },
                _ = tick.tick() => self.tick().await,
                _ = next_sweep(&mut sweep) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.health_sweep().await;
                    });
                }
                message = next_peer_message(&mut peers) => match message {
                    Ok(message) => {
                        if self.observe_peer(message).await == PeerAction::ReleaseRequested {
                            let this = self.clone();
                            tokio::spawn(async move { this.release_for_peer().await });
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} window broadcast messages", skipped);
                    }
                    Err(RecvError::Closed) => peers = None,
                },
            }
        }
        tracing::info!("Relay event loop stopped");
    }

    /// Submit a workflow; progress arrives on the returned handle.
    pub async fn submit_task(
        &self,
        workflow_type: &str,
        payload: Value,
    ) -> Result<TaskHandle, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = self
            .submit_task_with_sink(workflow_type, payload, Box::new(ChannelSink::new(tx)))
            .await?;
        Ok(TaskHandle::new(info, rx))
    }

    /// Submit a workflow with a caller-supplied progress sink.
    ///
    /// The task is registered before the HTTP call so frames racing the
    /// response find it, and its pending count pins the lock meanwhile.
    pub async fn submit_task_with_sink(
        &self,
        workflow_type: &str,
        payload: Value,
        sink: Box<dyn ProgressSink>,
    ) -> Result<TaskInfo, RelayError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RelayError::ShutDown);
        }
        let total_nodes = payload.as_object().map(|nodes| nodes.len()).unwrap_or(0);

        let (info, client_id, submit_timeout) = {
            let mut lock = self.inner.lock.lock().await;
            let (pending, preferred) = self.inner.core.lock().await.pending_and_preferred();
            let locked = lock.ensure_locked(pending, preferred.as_ref()).await;

            let mut core = self.inner.core.lock().await;
            core.sync_lock(lock.locked_server());
            let server = locked?;

            let info = TaskInfo::new(
                core.window.new_task_id(),
                workflow_type,
                server,
                self.inner.window_id,
                self.inner.clock.now(),
            );
            core.tasks
                .register(info.clone(), sink, total_nodes, Instant::now())?;
            lock.touch();
            core.announce_pending();
            (info, lock.client_id().to_string(), core.config.submit_timeout())
        };

        let server = info.bound_server_url.clone();
        let request = QueuePromptRequest {
            prompt: payload,
            client_id,
            prompt_id: Some(info.id.to_string()),
        };
        let submitted = tokio::time::timeout(
            submit_timeout,
            self.inner.server_api.queue_prompt(&server, request),
        )
        .await
        .unwrap_or(Err(SubmitError::Timeout));

        let mut core = self.inner.core.lock().await;
        let response = match submitted {
            Ok(response) => response,
            Err(source) => {
                if source.is_server_fault() {
                    self.inner.registry.mark_failure(&server);
                }
                tracing::warn!("Submitting {} task to {} failed: {}", workflow_type, server, source);
                core.tasks.fail(&info.id, source.to_string(), Instant::now());
                core.announce_pending();
                return Err(RelayError::Submit { server, source });
            }
        };

        let info = if response.prompt_id == info.id.as_str() {
            info
        } else {
            tracing::warn!(
                "Server {} assigned its own prompt id {} (requested {})",
                server,
                response.prompt_id,
                info.id
            );
            let assigned = TaskId::new(response.prompt_id);
            core.tasks
                .rekey(&info.id, assigned.clone())
                .unwrap_or(TaskInfo { id: assigned, ..info })
        };

        tracing::info!(
            task_id = %info.id,
            workflow_type = %info.workflow_type,
            server = %server,
            "Task submitted"
        );
        Ok(info)
    }

    /// Route one push frame to its task. Only the task state is locked.
    async fn handle_frame(&self, frame: PushFrame) {
        self.inner.activity.touch();
        let mut core = self.inner.core.lock().await;
        let core = &mut *core;
        let outcome = core
            .dispatcher
            .dispatch(frame, &mut core.tasks, Instant::now());
        if let DispatchOutcome::Retired(task) = outcome {
            if task.status == TaskStatus::Completed {
                self.inner.registry.mark_success(&task.bound_server_url);
            }
            tracing::info!(task_id = %task.id, status = %task.status, "Task finished");
            core.announce_pending();
        }
    }

    async fn handle_closed(&self, connection_id: u64, unexpected: bool) {
        let mut lock = self.inner.lock.lock().await;
        let pending = self.inner.core.lock().await.tasks.pending_count();
        match lock.handle_closed(connection_id, pending) {
            CloseDisposition::Stale => {
                tracing::debug!("Ignoring close of superseded connection #{}", connection_id);
            }
            CloseDisposition::Released(server) => {
                if unexpected {
                    self.inner.registry.mark_failure(&server);
                }
                self.inner.core.lock().await.sync_lock(None);
            }
            CloseDisposition::Reconnect(server) => {
                if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
                    tracing::debug!("Reconnect to {} already in progress", server);
                } else {
                    let this = self.clone();
                    tokio::spawn(async move { this.reconnect_loop(server).await });
                }
            }
        }
    }

    async fn reconnect_loop(self, server: ServerUrl) {
        self.reconnect(&server).await;
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Reconnect to the locked server with backoff. Sleeps happen outside
    /// both locks; exhausting the attempts fails every pending task.
    async fn reconnect(&self, server: &ServerUrl) {
        let policy = {
            let core = self.inner.core.lock().await;
            ReconnectPolicy::from_config(&core.config)
        };
        let mut backoff = BackoffState::new(policy);

        while let Some(delay) = backoff.next_delay_and_advance() {
            tracing::info!(
                "Reconnecting to {} (attempt {} of {}) in {}ms",
                server,
                backoff.attempts(),
                backoff.max_attempts(),
                delay.as_millis()
            );
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut lock = self.inner.lock.lock().await;
            if !lock.needs_reconnect(server) {
                return;
            }
            if self.inner.core.lock().await.tasks.is_empty() {
                lock.drop_lock();
                self.inner.core.lock().await.sync_lock(None);
                return;
            }
            if lock.reconnect().await.is_ok() {
                return;
            }
        }

        let mut lock = self.inner.lock.lock().await;
        if !lock.needs_reconnect(server) {
            return;
        }
        self.inner.registry.mark_failure(server);
        lock.drop_lock();

        let err = RelayError::ConnectionLost {
            server: server.clone(),
        };
        let mut core = self.inner.core.lock().await;
        let failed = core.tasks.fail_all(&err.to_string(), Instant::now());
        tracing::error!(
            "Gave up reconnecting to {}; {} tasks failed",
            server,
            failed.len()
        );
        core.sync_lock(None);
        core.announce_pending();
    }

    /// Periodic work: flush coalesced progress and release an idle lock.
    pub async fn tick(&self) {
        self.inner.core.lock().await.tasks.flush_due(Instant::now());

        // Skipped while a connect or probe holds the lock manager.
        let Ok(mut lock) = self.inner.lock.try_lock() else {
            return;
        };
        let mut core = self.inner.core.lock().await;
        if lock.release_lock(false, core.tasks.pending_count()) {
            tracing::info!("Released idle lock");
            core.sync_lock(None);
        }
    }

    /// Probe every server, then fail over or move back to the primary if
    /// nothing is pending.
    pub async fn health_sweep(&self) -> Vec<(ServerUrl, ProbeOutcome)> {
        let results = self.inner.prober.sweep().await;

        let mut lock = self.inner.lock.lock().await;
        let (pending, preferred) = self.inner.core.lock().await.pending_and_preferred();
        match lock.fail_over(pending, preferred.as_ref()).await {
            Ok(Some(server)) => tracing::info!("Failed over to {}", server),
            Ok(None) => {
                if lock.try_return_to_primary(pending).await {
                    tracing::info!("Returned to primary");
                }
            }
            Err(e) => tracing::warn!("Failover found no server: {}", e),
        }
        self.inner.core.lock().await.sync_lock(lock.locked_server());
        results
    }

    async fn observe_peer(&self, message: WindowMessage) -> PeerAction {
        let mut core = self.inner.core.lock().await;
        core.window.observe(message, Instant::now())
    }

    /// A peer asked for a reset: drop our lock unless tasks are bound to it.
    async fn release_for_peer(&self) {
        let mut lock = self.inner.lock.lock().await;
        let mut core = self.inner.core.lock().await;
        let pending = core.tasks.pending_count();
        if lock.release_lock(true, pending) {
            core.sync_lock(None);
        } else if pending > 0 {
            tracing::info!("Keeping lock for peer reset: {} tasks pending", pending);
        }
    }

    /// Waits for an in-progress lock acquisition to settle.
    pub async fn get_server_status(&self) -> ServerStatus {
        let lock = self.inner.lock.lock().await;
        let info = lock.lock_info();
        let core = self.inner.core.lock().await;
        ServerStatus {
            locked_server: info.as_ref().map(|l| l.server.clone()),
            is_connected: info.as_ref().is_some_and(|l| l.is_connected),
            pending_task_count: core.tasks.pending_count(),
            lock_timestamp: info.map(|l| l.lock_timestamp),
            window_id: self.inner.window_id,
            queue_remaining: core.dispatcher.queue_remaining(),
        }
    }

    /// Release this window's lock. Never releases while tasks are pending;
    /// `force` skips the idle requirement and asks peer windows to release too.
    pub async fn reset_lock(&self, force: bool) -> bool {
        let mut lock = self.inner.lock.lock().await;
        let mut core = self.inner.core.lock().await;
        if force {
            core.window.request_reset();
        }
        let released = lock.release_lock(force, core.tasks.pending_count());
        if released {
            core.sync_lock(None);
        }
        released
    }

    /// Probe every server and report its health and role.
    pub async fn list_all_server_statuses(&self) -> Vec<ServerStatusEntry> {
        let outcomes = self.inner.prober.sweep().await;
        let active = self.inner.lock.lock().await.locked_server().cloned();

        self.inner
            .registry
            .list_servers()
            .into_iter()
            .map(|entry| {
                let healthy = outcomes
                    .iter()
                    .find(|(url, _)| url == &entry.url)
                    .map(|(_, outcome)| outcome.is_healthy())
                    .unwrap_or_else(|| entry.is_healthy());
                ServerStatusEntry {
                    is_active: active.as_ref() == Some(&entry.url),
                    healthy,
                    is_primary: entry.is_primary,
                    failure_count: entry.consecutive_failures,
                    url: entry.url,
                }
            })
            .collect()
    }

    /// Mark a task completed although its completion frame never arrived.
    pub async fn force_complete(&self, task_id: &TaskId) -> Result<TaskInfo, RelayError> {
        let mut core = self.inner.core.lock().await;
        let info = core.tasks.force_complete(task_id, Instant::now())?;
        core.announce_pending();
        Ok(info)
    }

    /// Fetch URL of an artifact of a pending task, always on its bound server.
    pub async fn artifact_url(
        &self,
        task_id: &TaskId,
        artifact: &ArtifactRef,
    ) -> Result<String, RelayError> {
        let core = self.inner.core.lock().await;
        core.tasks.artifact_url(task_id, artifact)
    }

    /// Download a resolved artifact.
    pub async fn fetch_artifact(&self, artifact: &ResolvedArtifact) -> Result<Vec<u8>, RelayError> {
        self.inner
            .server_api
            .fetch_artifact(&artifact.url)
            .await
            .map_err(|source| RelayError::Fetch {
                url: artifact.url.clone(),
                source,
            })
    }

    /// Replace the server pool and tunables. The sweep interval only changes
    /// on the next `start`.
    pub async fn reload_servers(&self, config: RelayConfig) -> Result<(), RelayError> {
        config.validate()?;
        let (primary, backups) = config.server_urls()?;
        self.inner
            .registry
            .replace(primary, backups, config.switch_threshold);
        self.inner.prober.set_timeout(config.health_timeout());

        let mut lock = self.inner.lock.lock().await;
        let mut core = self.inner.core.lock().await;
        core.tasks.set_progress_interval(config.progress_interval());
        core.dispatcher
            .set_near_complete_percent(config.near_complete_percent);
        core.window.set_peer_ttl(config.idle_release());
        lock.set_idle_release(config.idle_release());

        if let Some(locked) = lock.locked_server().cloned() {
            if !self.inner.registry.contains(&locked) && core.tasks.is_empty() {
                tracing::info!("Locked server {} left the pool, releasing", locked);
                lock.drop_lock();
                core.sync_lock(None);
            }
        }
        core.config = config;
        Ok(())
    }

    /// Stop the event loop, fail whatever is still pending and close the connection.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut lock = self.inner.lock.lock().await;
        let mut core = self.inner.core.lock().await;
        let failed = core
            .tasks
            .fail_all(&RelayError::ShutDown.to_string(), Instant::now());
        if !failed.is_empty() {
            tracing::warn!("{} tasks abandoned at shutdown", failed.len());
        }
        lock.drop_lock();
        core.sync_lock(None);
    }
}

async fn next_sweep(sweep: &mut Option<tokio::time::Interval>) {
    match sweep {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_peer_message(
    peers: &mut Option<broadcast::Receiver<WindowMessage>>,
) -> Result<WindowMessage, RecvError> {
    match peers {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
impl RelayCoordinator {
    /// Handle every connection event queued so far (tests drive the loop by hand).
    pub(crate) async fn process_pending_events(&self) {
        loop {
            let event = {
                let mut guard = self.inner.events_rx.lock().unwrap_or_else(|p| p.into_inner());
                match guard.as_mut() {
                    Some(rx) => rx.try_recv().ok(),
                    None => None,
                }
            };
            match event {
                Some(event) => self.handle_connection_event(event).await,
                None => break,
            }
            tokio::task::yield_now().await;
        }
    }

    pub(crate) async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame { frame, .. } => self.handle_frame(frame).await,
            ConnectionEvent::Closed {
                connection_id,
                unexpected,
                ..
            } => self.handle_closed(connection_id, unexpected).await,
        }
    }

    pub(crate) async fn handle_peer_message(&self, message: WindowMessage) {
        if self.observe_peer(message).await == PeerAction::ReleaseRequested {
            self.release_for_peer().await;
        }
    }

    pub(crate) async fn settle(&self, duration: std::time::Duration) {
        tokio::time::sleep(duration).await;
        self.process_pending_events().await;
    }
}

#[cfg(test)]
mod tests;
