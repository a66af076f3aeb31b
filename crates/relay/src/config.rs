//! Relay configuration
//!
//! Loaded from the environment (with `.env` support) by the binary, or built
//! directly / deserialized from JSON by embedding applications. The same
//! struct drives hot reloads of the server pool.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use comfyrelay_domain::{DomainError, ServerUrl};

/// Configuration for the server pool, lock manager and progress delivery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Primary inference server URL
    pub primary_url: String,
    /// Backup server URLs, in failover order
    pub backup_urls: Vec<String>,
    /// Timeout of one health probe in milliseconds
    pub health_timeout_ms: u64,
    /// Consecutive failures before the locked server is abandoned (when idle)
    pub switch_threshold: u32,
    /// Reconnect attempts to the locked server while tasks are pending
    pub reconnect_attempts: u32,
    /// First reconnect delay in milliseconds, doubled per attempt
    pub reconnect_base_delay_ms: u64,
    /// Idle time after which an unused lock is released
    pub idle_release_secs: u64,
    /// Minimum spacing between progress deliveries of one task
    pub progress_interval_ms: u64,
    /// Node-progress percent a task must pass before progress is forwarded
    pub near_complete_percent: u8,
    /// Periodic health sweep interval, 0 disables
    pub health_sweep_secs: u64,
    /// Timeout of the submit HTTP call
    pub submit_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            primary_url: "http://localhost:8188".to_string(),
            backup_urls: Vec::new(),
            health_timeout_ms: 5_000,
            switch_threshold: 2,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            idle_release_secs: 300,
            progress_interval_ms: 100,
            near_complete_percent: 85,
            health_sweep_secs: 0,
            submit_timeout_secs: 30,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        _ => Ok(default),
    }
}

impl RelayConfig {
    /// Load configuration from environment variables (reads `.env` first if present)
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env loaded: {}", e);
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            primary_url: lookup("COMFYUI_PRIMARY_URL").unwrap_or(defaults.primary_url),
            backup_urls: lookup("COMFYUI_BACKUP_URLS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            health_timeout_ms: parse_or(&lookup, "COMFYUI_HEALTH_TIMEOUT_MS", defaults.health_timeout_ms)?,
            switch_threshold: parse_or(&lookup, "COMFYUI_SWITCH_THRESHOLD", defaults.switch_threshold)?,
            reconnect_attempts: parse_or(&lookup, "COMFYUI_RECONNECT_ATTEMPTS", defaults.reconnect_attempts)?,
            reconnect_base_delay_ms: parse_or(
                &lookup,
                "COMFYUI_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay_ms,
            )?,
            idle_release_secs: parse_or(&lookup, "COMFYUI_IDLE_RELEASE_SECS", defaults.idle_release_secs)?,
            progress_interval_ms: parse_or(
                &lookup,
                "COMFYUI_PROGRESS_INTERVAL_MS",
                defaults.progress_interval_ms,
            )?,
            near_complete_percent: parse_or(
                &lookup,
                "COMFYUI_NEAR_COMPLETE_PERCENT",
                defaults.near_complete_percent,
            )?,
            health_sweep_secs: parse_or(&lookup, "COMFYUI_HEALTH_SWEEP_SECS", defaults.health_sweep_secs)?,
            submit_timeout_secs: parse_or(&lookup, "COMFYUI_SUBMIT_TIMEOUT_SECS", defaults.submit_timeout_secs)?,
        };

        config
            .validate()
            .context("Invalid ComfyUI relay configuration")?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), DomainError> {
        self.server_urls()?;
        if !(1..=10).contains(&self.switch_threshold) {
            return Err(DomainError::validation("switch_threshold must be between 1 and 10"));
        }
        if self.reconnect_attempts > 20 {
            return Err(DomainError::validation("reconnect_attempts must be at most 20"));
        }
        if self.health_timeout_ms == 0 {
            return Err(DomainError::validation("health_timeout_ms must be greater than 0"));
        }
        if self.progress_interval_ms == 0 {
            return Err(DomainError::validation("progress_interval_ms must be greater than 0"));
        }
        if self.near_complete_percent > 100 {
            return Err(DomainError::validation("near_complete_percent must be at most 100"));
        }
        if self.submit_timeout_secs == 0 {
            return Err(DomainError::validation("submit_timeout_secs must be greater than 0"));
        }
        Ok(())
    }

    /// Parsed primary and backup URLs. Backups equal to the primary or to an
    /// earlier backup are dropped.
    pub fn server_urls(&self) -> Result<(ServerUrl, Vec<ServerUrl>), DomainError> {
        let primary = ServerUrl::parse(&self.primary_url)?;
        let mut backups: Vec<ServerUrl> = Vec::with_capacity(self.backup_urls.len());
        for raw in &self.backup_urls {
            let url = ServerUrl::parse(raw)?;
            if url != primary && !backups.contains(&url) {
                backups.push(url);
            }
        }
        Ok((primary, backups))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn idle_release(&self) -> Duration {
        Duration::from_secs(self.idle_release_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    /// `None` when the periodic sweep is disabled.
    pub fn health_sweep_interval(&self) -> Option<Duration> {
        (self.health_sweep_secs > 0).then(|| Duration::from_secs(self.health_sweep_secs))
    }
}
