//! Embedded copy-on-write backend registry.

use crate::backend::Backend;
use crate::health::{HealthStatus, HealthThresholds, HealthTracker, ProbeOutcome};
use crate::registry::{Heartbeat, Registry, RegistryError, RegistryEvent, ServerStatus};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the membership event channel.
const EVENT_CAPACITY: usize = 256;

/// One registered backend together with its health bookkeeping.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    pub backend: Backend,
    pub health: HealthTracker,
    pub registered_at: Instant,
    pub last_heartbeat_at: Instant,
    pub reported_status: ServerStatus,
    pub started_at: Option<SystemTime>,
}

impl BackendEntry {
    fn new(backend: Backend, now: Instant) -> Self {
        let mut entry = Self {
            backend,
            health: HealthTracker::new(),
            registered_at: now,
            last_heartbeat_at: now,
            reported_status: ServerStatus::Starting,
            started_at: None,
        };
        entry.sync_health();
        entry.backend.refresh_queue_full();
        entry
    }

    pub fn url(&self) -> &str {
        &self.backend.url
    }

    pub fn is_healthy(&self) -> bool {
        self.backend.is_healthy()
    }

    pub fn status(&self) -> HealthStatus {
        self.health.status()
    }

    /// Mirror the tracker into the backend's health fields.
    fn sync_health(&mut self) {
        self.backend.set_health(
            self.health.is_passing(),
            self.health.failures(),
            self.health.successes(),
            self.health.last_check(),
        );
    }
}

/// Result of applying one probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRecorded {
    pub status: HealthStatus,
    /// The passing bit flipped
    pub changed: bool,
}

/// Shared handle to an immutable entry.
pub type BackendRef = Arc<BackendEntry>;

/// Point-in-time ordered view of the registry.
pub type Snapshot = Arc<Vec<BackendRef>>;

/// Embedded registry.
///
/// Writers take one mutex, copy the ordered vector of entry handles,
/// rebuild the touched entry and publish the result. Readers only ever
/// load the published vector.
pub struct BackendRegistry {
    entries: ArcSwap<Vec<BackendRef>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
    /// Whether probes can still promote a backend.
    active_probing: AtomicBool,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            events,
            active_probing: AtomicBool::new(true),
        }
    }

    /// Tell the registry whether an active prober is running.
    ///
    /// Without one nothing could promote a backend, so a heartbeat that
    /// clears staleness restores it directly and entries left failing by
    /// earlier probes pass again.
    pub fn set_active_probing(&self, enabled: bool) {
        let _guard = self.write_lock.lock();
        let was_enabled = self.active_probing.swap(enabled, Ordering::SeqCst);
        if enabled || !was_enabled {
            return;
        }

        let current = self.entries.load();
        let mut restored = 0;
        let next: Vec<BackendRef> = current
            .iter()
            .map(|entry| {
                if entry.health.is_passing() || entry.health.is_stale() {
                    return Arc::clone(entry);
                }
                let mut updated = BackendEntry::clone(entry);
                updated.health.restore();
                updated.sync_health();
                restored += 1;
                Arc::new(updated)
            })
            .collect();

        if restored > 0 {
            self.entries.store(Arc::new(next));
            info!(restored, "active probing off, failing backends restored");
        }
    }

    /// Add a backend. Registration counts as its first heartbeat.
    pub fn register(&self, backend: Backend) -> Result<(), RegistryError> {
        if backend.url.trim().is_empty() {
            return Err(RegistryError::InvalidBackend("url must not be empty".to_string()));
        }

        let url = backend.url.clone();
        {
            let _guard = self.write_lock.lock();
            let current = self.entries.load();
            if current.iter().any(|e| e.url() == url) {
                return Err(RegistryError::DuplicateBackend(url));
            }

            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::new(BackendEntry::new(backend, Instant::now())));
            self.entries.store(Arc::new(next));

            // Sent under the lock so subscribers see membership in order.
            let _ = self.events.send(RegistryEvent::Registered(url.clone()));
        }

        info!(url = %url, "backend registered");
        Ok(())
    }

    /// Apply a heartbeat: merge metrics, refresh liveness and clear staleness.
    ///
    /// The passing bit is left alone unless active probing is off, in which
    /// case clearing staleness also restores it.
    pub fn heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RegistryError> {
        let Heartbeat {
            url,
            status,
            started_at,
            metrics,
            ..
        } = heartbeat;

        let promote = !self.active_probing.load(Ordering::SeqCst);
        self.update(&url, |entry| {
            if let Some(metrics) = metrics {
                entry.backend.update_metrics(metrics);
            }
            entry.last_heartbeat_at = Instant::now();
            entry.reported_status = status;
            if started_at.is_some() {
                entry.started_at = started_at;
            }
            if entry.health.is_stale() {
                let restored = entry.health.clear_stale(promote);
                entry.sync_health();
                info!(
                    url = %entry.url(),
                    restored,
                    "heartbeat resumed, backend no longer stale"
                );
            }
        })?;

        debug!(url = %url, status = %status, "heartbeat recorded");
        Ok(())
    }

    /// Remove a backend, returning its last descriptor.
    pub fn remove(&self, url: &str) -> Result<Backend, RegistryError> {
        let removed = {
            let _guard = self.write_lock.lock();
            let current = self.entries.load();
            let Some(pos) = current.iter().position(|e| e.url() == url) else {
                return Err(RegistryError::UnknownBackend(url.to_string()));
            };

            let mut next: Vec<BackendRef> = current.iter().cloned().collect();
            let entry = next.remove(pos);
            self.entries.store(Arc::new(next));
            let _ = self.events.send(RegistryEvent::Removed(url.to_string()));
            entry
        };

        info!(url = %url, "backend removed");
        Ok(removed.backend.clone())
    }

    /// Immutable ordered view; never blocks.
    pub fn snapshot(&self) -> Snapshot {
        self.entries.load_full()
    }

    pub fn get(&self, url: &str) -> Option<BackendRef> {
        self.entries.load().iter().find(|e| e.url() == url).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Subscribe to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Apply a probe result. The only path that changes the passing bit
    /// apart from staleness.
    pub fn record_probe(
        &self,
        url: &str,
        outcome: ProbeOutcome,
        thresholds: HealthThresholds,
    ) -> Result<ProbeRecorded, RegistryError> {
        self.update(url, |entry| {
            let flipped = entry.health.record(outcome, thresholds);
            entry.sync_health();

            if flipped {
                if entry.health.is_passing() {
                    info!(
                        url = %entry.url(),
                        successes = entry.health.successes(),
                        "backend marked healthy"
                    );
                } else {
                    warn!(
                        url = %entry.url(),
                        failures = entry.health.failures(),
                        "backend marked unhealthy"
                    );
                }
            } else if outcome == ProbeOutcome::Success && entry.health.is_stale() {
                debug!(url = %entry.url(), "probe passed but backend is stale");
            }

            ProbeRecorded {
                status: entry.status(),
                changed: flipped,
            }
        })
    }

    /// Force every backend silent for longer than `timeout` unhealthy.
    ///
    /// Returns the urls that became stale in this sweep.
    pub fn expire_stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load();
        let mut expired = Vec::new();

        let next: Vec<BackendRef> = current
            .iter()
            .map(|entry| {
                let silent = now.saturating_duration_since(entry.last_heartbeat_at);
                if silent > timeout && !entry.health.is_stale() {
                    let mut updated = BackendEntry::clone(entry);
                    updated.health.mark_stale();
                    updated.sync_health();
                    warn!(
                        url = %updated.url(),
                        silent_ms = silent.as_millis() as u64,
                        "no heartbeat, backend marked stale"
                    );
                    expired.push(updated.backend.url.clone());
                    Arc::new(updated)
                } else {
                    Arc::clone(entry)
                }
            })
            .collect();

        if !expired.is_empty() {
            self.entries.store(Arc::new(next));
        }
        expired
    }

    /// Remove every backend silent for longer than `timeout`.
    pub fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let evicted: Vec<String> = {
            let _guard = self.write_lock.lock();
            let current = self.entries.load();
            let (gone, kept): (Vec<BackendRef>, Vec<BackendRef>) = current
                .iter()
                .cloned()
                .partition(|e| now.saturating_duration_since(e.last_heartbeat_at) > timeout);

            if gone.is_empty() {
                return Vec::new();
            }
            self.entries.store(Arc::new(kept));
            gone.iter()
                .map(|e| {
                    let _ = self.events.send(RegistryEvent::Removed(e.backend.url.clone()));
                    e.backend.url.clone()
                })
                .collect()
        };

        for url in &evicted {
            warn!(url = %url, "no heartbeat, backend evicted");
        }
        evicted
    }

    /// Rebuild one entry under the writer lock.
    fn update<T>(
        &self,
        url: &str,
        f: impl FnOnce(&mut BackendEntry) -> T,
    ) -> Result<T, RegistryError> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load();
        let Some(pos) = current.iter().position(|e| e.url() == url) else {
            return Err(RegistryError::UnknownBackend(url.to_string()));
        };

        let mut updated = BackendEntry::clone(&current[pos]);
        let result = f(&mut updated);

        let mut next: Vec<BackendRef> = current.iter().cloned().collect();
        next[pos] = Arc::new(updated);
        self.entries.store(Arc::new(next));
        Ok(result)
    }
}

impl Registry for BackendRegistry {
    fn register(&self, backend: Backend) -> impl Future<Output = Result<(), RegistryError>> + Send {
        std::future::ready(BackendRegistry::register(self, backend))
    }

    fn heartbeat(
        &self,
        heartbeat: Heartbeat,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send {
        std::future::ready(BackendRegistry::heartbeat(self, heartbeat))
    }

    fn remove(&self, url: &str) -> impl Future<Output = Result<(), RegistryError>> + Send {
        std::future::ready(BackendRegistry::remove(self, url).map(|_| ()))
    }

    fn watch(&self) -> Option<broadcast::Receiver<RegistryEvent>> {
        Some(self.subscribe())
    }
}
