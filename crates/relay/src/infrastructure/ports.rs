//! Port traits for infrastructure boundaries.
//!
//! Ports exist for:
//! - The inference server HTTP API (probe, submit, artifact download)
//! - The push connection (could swap WebSocket -> SSE)
//! - The window broadcast medium (in-process, no-op)
//! - Clock (for testing)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use comfyrelay_domain::{ProbeOutcome, ServerUrl};
use comfyrelay_shared::{QueuePromptRequest, QueuePromptResponse, WindowMessage};

use super::connection::{ConnectionEvent, ConnectionHandle};

// =============================================================================
// Inference server
// =============================================================================

/// Failure of an HTTP call against an inference server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server understood the request and refused it (4xx). Not a server fault.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out")]
    Timeout,
}

impl SubmitError {
    /// Whether this failure should count against the server's health.
    pub fn is_server_fault(&self) -> bool {
        !matches!(self, SubmitError::Rejected(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceServerPort: Send + Sync {
    /// Bounded-time status check. Every failure is folded into the outcome.
    async fn check_status(&self, server: &ServerUrl, timeout: Duration) -> ProbeOutcome;

    async fn queue_prompt(
        &self,
        server: &ServerUrl,
        request: QueuePromptRequest,
    ) -> Result<QueuePromptResponse, SubmitError>;

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>, SubmitError>;
}

// =============================================================================
// Push connection
// =============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Connecting to {url} timed out")]
    Timeout { url: String },

    #[error("Connecting to {url} failed: {reason}")]
    Failed { url: String, reason: String },
}

/// Opens push connections. Frames and the final close notice of every
/// connection are sent to `events`, tagged with `connection_id`.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(
        &self,
        server: &ServerUrl,
        client_id: &str,
        connection_id: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnectionHandle, ConnectError>;
}

// =============================================================================
// Window broadcast
// =============================================================================

/// Best-effort publish/subscribe medium shared by the windows of one user.
pub trait BroadcastPort: Send + Sync {
    fn publish(&self, message: WindowMessage);
    fn subscribe(&self) -> broadcast::Receiver<WindowMessage>;
}

// =============================================================================
// Testing ports
// =============================================================================

pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
