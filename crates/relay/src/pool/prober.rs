//! Health prober - bounded-time status checks recorded into the pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use comfyrelay_domain::{ProbeOutcome, ServerUrl, UnhealthyReason};

use super::ServerPoolRegistry;
use crate::infrastructure::ports::{ClockPort, InferenceServerPort};

/// Probes servers and records every outcome in the registry.
///
/// Never fails: transport errors, non-2xx answers and timeouts all become
/// [`ProbeOutcome::Unhealthy`].
#[derive(Clone)]
pub struct HealthProber {
    server_api: Arc<dyn InferenceServerPort>,
    registry: ServerPoolRegistry,
    clock: Arc<dyn ClockPort>,
    timeout_ms: Arc<AtomicU64>,
}

impl HealthProber {
    pub fn new(
        server_api: Arc<dyn InferenceServerPort>,
        registry: ServerPoolRegistry,
        clock: Arc<dyn ClockPort>,
        timeout: Duration,
    ) -> Self {
        Self {
            server_api,
            registry,
            clock,
            timeout_ms: Arc::new(AtomicU64::new(duration_ms(timeout))),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
    }

    /// One status check, cut off at `timeout` even if the adapter ignores it.
    pub async fn probe(&self, url: &ServerUrl, timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, self.server_api.check_status(url, timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Unhealthy(UnhealthyReason::Timeout),
        }
    }

    /// Probe with the configured timeout and record the result.
    pub async fn probe_and_record(&self, url: &ServerUrl) -> ProbeOutcome {
        let outcome = self.probe(url, self.timeout()).await;
        tracing::debug!("Probe {}: {}", url, outcome);
        self.registry.record_probe(url, outcome, self.clock.now());
        outcome
    }

    /// Probe every server in the pool concurrently.
    pub async fn sweep(&self) -> Vec<(ServerUrl, ProbeOutcome)> {
        let urls = self.registry.failover_order(None);
        let outcomes = join_all(urls.iter().map(|url| self.probe_and_record(url))).await;
        urls.into_iter().zip(outcomes).collect()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
