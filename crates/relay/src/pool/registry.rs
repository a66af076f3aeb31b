//! Server pool registry - ordered candidates and their failure counters

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use comfyrelay_domain::{ProbeOutcome, ProbeRecord, ServerEntry, ServerUrl};

/// Result of recording a failure against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureMark {
    pub consecutive_failures: u32,
    /// True once the counter reached the switch threshold.
    pub over_threshold: bool,
}

struct PoolInner {
    /// Primary first, then backups in configured order.
    entries: Vec<ServerEntry>,
    switch_threshold: u32,
}

/// Ordered set of candidate servers.
///
/// Cheap to clone; clones share the same pool. The order of
/// [`list_servers`](Self::list_servers) is the failover search order.
#[derive(Clone)]
pub struct ServerPoolRegistry {
    inner: Arc<RwLock<PoolInner>>,
}

impl ServerPoolRegistry {
    pub fn new(primary: ServerUrl, backups: Vec<ServerUrl>, switch_threshold: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PoolInner {
                entries: build_entries(primary, backups),
                switch_threshold: switch_threshold.max(1),
            })),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PoolInner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn list_servers(&self) -> Vec<ServerEntry> {
        self.read().entries.clone()
    }

    pub fn primary(&self) -> Option<ServerEntry> {
        self.read().entries.iter().find(|e| e.is_primary).cloned()
    }

    pub fn get(&self, url: &ServerUrl) -> Option<ServerEntry> {
        self.read().entries.iter().find(|e| &e.url == url).cloned()
    }

    pub fn contains(&self, url: &ServerUrl) -> bool {
        self.read().entries.iter().any(|e| &e.url == url)
    }

    /// Increment the failure counter. Unknown URLs (removed by a reload) are ignored.
    pub fn mark_failure(&self, url: &ServerUrl) -> FailureMark {
        let mut inner = self.write();
        let threshold = inner.switch_threshold;
        match inner.entries.iter_mut().find(|e| &e.url == url) {
            Some(entry) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                let mark = FailureMark {
                    consecutive_failures: entry.consecutive_failures,
                    over_threshold: entry.consecutive_failures >= threshold,
                };
                if mark.over_threshold {
                    tracing::warn!(
                        "Server {} reached {} consecutive failures (threshold {})",
                        url,
                        mark.consecutive_failures,
                        threshold
                    );
                }
                mark
            }
            None => FailureMark {
                consecutive_failures: 0,
                over_threshold: false,
            },
        }
    }

    pub fn mark_success(&self, url: &ServerUrl) {
        let mut inner = self.write();
        if let Some(entry) = inner.entries.iter_mut().find(|e| &e.url == url) {
            if entry.consecutive_failures > 0 {
                tracing::info!("Server {} recovered after {} failures", url, entry.consecutive_failures);
            }
            entry.consecutive_failures = 0;
        }
    }

    /// Store a probe result and update the failure counter accordingly.
    pub fn record_probe(&self, url: &ServerUrl, outcome: ProbeOutcome, at: DateTime<Utc>) {
        {
            let mut inner = self.write();
            if let Some(entry) = inner.entries.iter_mut().find(|e| &e.url == url) {
                entry.last_probe = Some(ProbeRecord { outcome, at });
            }
        }
        if outcome.is_healthy() {
            self.mark_success(url);
        } else {
            self.mark_failure(url);
        }
    }

    pub fn is_over_threshold(&self, url: &ServerUrl) -> bool {
        let inner = self.read();
        inner
            .entries
            .iter()
            .find(|e| &e.url == url)
            .is_some_and(|e| e.consecutive_failures >= inner.switch_threshold)
    }

    /// Candidates in search order, without `skip`.
    pub fn failover_order(&self, skip: Option<&ServerUrl>) -> Vec<ServerUrl> {
        self.read()
            .entries
            .iter()
            .filter(|e| Some(&e.url) != skip)
            .map(|e| e.url.clone())
            .collect()
    }

    /// Replace the pool (config hot reload). Counters and probe records of
    /// servers present before and after the reload are kept.
    pub fn replace(&self, primary: ServerUrl, backups: Vec<ServerUrl>, switch_threshold: u32) {
        let mut inner = self.write();
        let mut entries = build_entries(primary, backups);
        for entry in &mut entries {
            if let Some(old) = inner.entries.iter().find(|old| old.url == entry.url) {
                entry.consecutive_failures = old.consecutive_failures;
                entry.last_probe = old.last_probe;
            }
        }
        tracing::info!(
            "Server pool replaced: {} servers (primary {})",
            entries.len(),
            entries.first().map(|e| e.url.as_str()).unwrap_or("-")
        );
        inner.entries = entries;
        inner.switch_threshold = switch_threshold.max(1);
    }
}

fn build_entries(primary: ServerUrl, backups: Vec<ServerUrl>) -> Vec<ServerEntry> {
    let mut entries = vec![ServerEntry::primary(primary)];
    for url in backups {
        if !entries.iter().any(|e| e.url == url) {
            entries.push(ServerEntry::backup(url));
        }
    }
    entries
}
