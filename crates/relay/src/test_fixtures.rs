//! Hand-written fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU8;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use comfyrelay_domain::{ProbeOutcome, ServerUrl};
use comfyrelay_shared::{PushFrame, QueuePromptRequest, QueuePromptResponse};

use crate::infrastructure::connection::{
    set_connection_state, ConnectionEvent, ConnectionHandle, ConnectionState,
};
use crate::infrastructure::ports::{ConnectError, InferenceServerPort, PushConnector, SubmitError};

pub fn url(s: &str) -> ServerUrl {
    ServerUrl::parse(s).unwrap()
}

// =============================================================================
// FakeServers - the HTTP side of a pool of inference servers
// =============================================================================

/// Every server is healthy and accepts submissions unless told otherwise.
#[derive(Default)]
pub struct FakeServers {
    health: Mutex<HashMap<ServerUrl, ProbeOutcome>>,
    probes: Mutex<Vec<ServerUrl>>,
    submissions: Mutex<Vec<(ServerUrl, QueuePromptRequest)>>,
    submit_failures: Mutex<HashMap<ServerUrl, SubmitError>>,
    submit_delay: Mutex<Option<Duration>>,
    assigned_ids: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeServers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_health(&self, server: &str, outcome: ProbeOutcome) {
        self.health.lock().unwrap().insert(url(server), outcome);
    }

    pub fn fail_submissions(&self, server: &str, error: SubmitError) {
        self.submit_failures.lock().unwrap().insert(url(server), error);
    }

    /// Hold every later submission for `delay` before answering.
    pub fn delay_submissions(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = Some(delay);
    }

    /// Answer the next submission with this prompt id instead of echoing the request's.
    pub fn assign_prompt_id(&self, id: &str) {
        self.assigned_ids.lock().unwrap().push(id.to_string());
    }

    pub fn probe_log(&self) -> Vec<ServerUrl> {
        self.probes.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> Vec<(ServerUrl, QueuePromptRequest)> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceServerPort for FakeServers {
    async fn check_status(&self, server: &ServerUrl, _timeout: Duration) -> ProbeOutcome {
        self.probes.lock().unwrap().push(server.clone());
        self.health
            .lock()
            .unwrap()
            .get(server)
            .copied()
            .unwrap_or(ProbeOutcome::Healthy)
    }

    async fn queue_prompt(
        &self,
        server: &ServerUrl,
        request: QueuePromptRequest,
    ) -> Result<QueuePromptResponse, SubmitError> {
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.submit_failures.lock().unwrap().get(server) {
            return Err(error.clone());
        }
        let assigned = self.assigned_ids.lock().unwrap().pop();
        let mut submissions = self.submissions.lock().unwrap();
        let prompt_id = assigned
            .or_else(|| request.prompt_id.clone())
            .unwrap_or_else(|| format!("server-{}", submissions.len()));
        submissions.push((server.clone(), request));
        Ok(QueuePromptResponse {
            prompt_id,
            number: Some(submissions.len() as u64),
            node_errors: None,
        })
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>, SubmitError> {
        self.fetched.lock().unwrap().push(url.to_string());
        Ok(url.as_bytes().to_vec())
    }
}

// =============================================================================
// FakeConnector - push connections driven by the test
// =============================================================================

struct FakeConnection {
    id: u64,
    server: ServerUrl,
    state: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    disconnect_rx: oneshot::Receiver<()>,
    open: bool,
}

impl FakeConnection {
    fn is_open(&mut self) -> bool {
        if self.open && self.disconnect_rx.try_recv() != Err(oneshot::error::TryRecvError::Empty) {
            self.open = false;
        }
        self.open
    }
}

#[derive(Default)]
struct ConnectorInner {
    refused: HashSet<ServerUrl>,
    connections: Vec<FakeConnection>,
}

#[derive(Default)]
pub struct FakeConnector {
    inner: Mutex<ConnectorInner>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, server: &str) {
        self.inner.lock().unwrap().refused.insert(url(server));
    }

    pub fn accept(&self, server: &str) {
        self.inner.lock().unwrap().refused.remove(&url(server));
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn connects_to(&self, server: &str) -> usize {
        let server = url(server);
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|c| c.server == server)
            .count()
    }

    pub fn latest_connection_id(&self) -> Option<u64> {
        self.inner.lock().unwrap().connections.last().map(|c| c.id)
    }

    pub fn is_open(&self, server: &str) -> bool {
        let server = url(server);
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter_mut()
            .filter(|c| c.server == server)
            .any(|c| c.is_open())
    }

    /// Deliver a frame on the newest open connection to `server`.
    pub fn push(&self, server: &str, frame: PushFrame) -> bool {
        let server = url(server);
        let mut inner = self.inner.lock().unwrap();
        for conn in inner.connections.iter_mut().rev() {
            if conn.server == server && conn.is_open() {
                return conn
                    .events
                    .send(ConnectionEvent::Frame {
                        connection_id: conn.id,
                        frame,
                    })
                    .is_ok();
            }
        }
        false
    }

    /// Simulate the server going away: every open connection to it closes.
    pub fn drop_connections(&self, server: &str) {
        let server = url(server);
        let mut inner = self.inner.lock().unwrap();
        for conn in inner.connections.iter_mut().filter(|c| c.server == server) {
            if conn.is_open() {
                conn.open = false;
                set_connection_state(&conn.state, ConnectionState::Disconnected);
                let _ = conn.events.send(ConnectionEvent::Closed {
                    connection_id: conn.id,
                    server: conn.server.clone(),
                    unexpected: true,
                });
            }
        }
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(
        &self,
        server: &ServerUrl,
        _client_id: &str,
        connection_id: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refused.contains(server) {
            return Err(ConnectError::Failed {
                url: server.push_url("test"),
                reason: "connection refused".to_string(),
            });
        }
        let state = Arc::new(AtomicU8::new(ConnectionState::Connected.to_u8()));
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        inner.connections.push(FakeConnection {
            id: connection_id,
            server: server.clone(),
            state: Arc::clone(&state),
            events,
            disconnect_rx,
            open: true,
        });
        Ok(ConnectionHandle::new(
            connection_id,
            server.clone(),
            state,
            disconnect_tx,
        ))
    }
}
