//! Inference servers - canonical addresses, pool entries and probe outcomes

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::DomainError;

/// Canonical base address of one inference server.
///
/// Always http(s), never ends with a slash. Two spellings of the same server
/// (`http://gpu:8188/` and `http://gpu:8188`) compare equal once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerUrl(String);

impl ServerUrl {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(DomainError::invalid_url(raw, "empty"));
        }
        let parsed = Url::parse(trimmed).map_err(|e| DomainError::invalid_url(raw, e.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(DomainError::invalid_url(
                    raw,
                    format!("unsupported scheme '{}'", other),
                ))
            }
        }
        if parsed.host_str().is_none() {
            return Err(DomainError::invalid_url(raw, "missing host"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `{base}/{path}` for an HTTP endpoint on this server.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.0, path.trim_start_matches('/'))
    }

    /// Push-connection address (`ws(s)://host/ws?clientId=...`).
    pub fn push_url(&self, client_id: &str) -> String {
        let ws_base = if let Some(rest) = self.0.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.0.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.0.clone()
        };
        format!("{}/ws?clientId={}", ws_base, client_id)
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServerUrl {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServerUrl> for String {
    fn from(value: ServerUrl) -> Self {
        value.0
    }
}

/// Why a probe classified a server as unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyReason {
    Timeout,
    Http(u16),
    ConnectionError,
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhealthyReason::Timeout => write!(f, "timeout"),
            UnhealthyReason::Http(code) => write!(f, "http_{}", code),
            UnhealthyReason::ConnectionError => write!(f, "connection_error"),
        }
    }
}

/// Result of one bounded-time status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(UnhealthyReason),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy => write!(f, "healthy"),
            ProbeOutcome::Unhealthy(reason) => write!(f, "unhealthy ({})", reason),
        }
    }
}

/// Last probe result kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub outcome: ProbeOutcome,
    pub at: DateTime<Utc>,
}

/// One candidate server in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub url: ServerUrl,
    pub is_primary: bool,
    pub consecutive_failures: u32,
    pub last_probe: Option<ProbeRecord>,
}

impl ServerEntry {
    pub fn primary(url: ServerUrl) -> Self {
        Self {
            url,
            is_primary: true,
            consecutive_failures: 0,
            last_probe: None,
        }
    }

    pub fn backup(url: ServerUrl) -> Self {
        Self {
            url,
            is_primary: false,
            consecutive_failures: 0,
            last_probe: None,
        }
    }

    /// Best current knowledge of health: the last probe if any, else the failure counter.
    pub fn is_healthy(&self) -> bool {
        match self.last_probe {
            Some(record) => record.outcome.is_healthy(),
            None => self.consecutive_failures == 0,
        }
    }
}
