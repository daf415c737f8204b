//! Health monitor.
//!
//! A supervisor task follows registry membership events and keeps one
//! probe task per backend. It also sweeps for backends whose heartbeats
//! stopped. Each probe task owns a cancellation token; removing a backend
//! cancels its token, and stopping the monitor cancels and joins them all.

use crate::config::Config;
use crate::health::{HealthStatus, HealthThresholds, ProbeOutcome, Prober};
use crate::metrics::{LivenessEvent, MetricsCollector};
use crate::registry::{BackendRegistry, RegistryError, RegistryEvent};
use crate::util::ServiceHandle;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a probe task needs.
#[derive(Clone)]
struct ProbeContext {
    registry: Arc<BackendRegistry>,
    prober: Prober,
    thresholds: HealthThresholds,
    interval: Duration,
    metrics: Option<MetricsCollector>,
}

/// Active and passive health monitoring for one registry.
pub struct HealthMonitor {
    probe: ProbeContext,
    probes_enabled: bool,
    staleness_timeout: Duration,
    eviction_timeout: Option<Duration>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: &Config) -> Self {
        let hc = &config.healthcheck;
        Self {
            probe: ProbeContext {
                registry,
                prober: Prober::new(hc, config.layer()),
                thresholds: HealthThresholds::from(hc),
                interval: hc.interval,
                metrics: None,
            },
            probes_enabled: hc.enabled,
            staleness_timeout: hc.staleness_timeout(),
            eviction_timeout: hc.eviction_timeout,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.probe.metrics = Some(metrics);
        self
    }

    /// Spawn the supervisor under a child token of `parent`.
    pub fn start(self, parent: &CancellationToken) -> ServiceHandle {
        ServiceHandle::spawn("health-monitor", parent, move |token| self.run(token))
    }

    async fn run(self, shutdown: CancellationToken) {
        // Subscribe before seeding so no registration is missed in between
        let mut events = self.probe.registry.subscribe();
        let mut tasks = ProbeTasks::default();
        self.probe.registry.set_active_probing(self.probes_enabled);

        info!(
            probes = self.probes_enabled,
            protocol = ?self.probe.prober.protocol(),
            interval_ms = self.probe.interval.as_millis() as u64,
            staleness_ms = self.staleness_timeout.as_millis() as u64,
            "health monitor starting"
        );

        self.resync(&mut tasks, &shutdown);

        let mut sweep = interval(self.probe.interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(RegistryEvent::Registered(url)) => {
                        self.spawn_probe(&mut tasks, &shutdown, url);
                    }
                    Ok(RegistryEvent::Removed(url)) => {
                        if tasks.cancel(&url) {
                            debug!(url = %url, "cancelling probe for removed backend");
                        }
                        self.forget(&url);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "health monitor lagged behind registry events, resyncing");
                        self.resync(&mut tasks, &shutdown);
                    }
                    Err(RecvError::Closed) => {
                        debug!("registry event channel closed");
                        shutdown.cancelled().await;
                        break;
                    }
                },

                _ = sweep.tick() => self.sweep(),

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((url, generation)) => {
                        tasks.reap(&url, generation);
                        // A write that raced the removal may have recreated series
                        if self.probe.registry.get(&url).is_none() {
                            self.forget(&url);
                        }
                    }
                    Err(e) if e.is_panic() => error!(error = %e, "probe task panicked"),
                    Err(_) => {}
                },
            }
        }

        tasks.shutdown().await;
        info!("health monitor stopped");
    }

    /// Align probe tasks with the current registry contents.
    fn resync(&self, tasks: &mut ProbeTasks, shutdown: &CancellationToken) {
        let snapshot = self.probe.registry.snapshot();
        let present: HashSet<&str> = snapshot.iter().map(|e| e.url()).collect();

        for url in tasks.retain(&present) {
            self.forget(&url);
        }
        for entry in snapshot.iter() {
            self.spawn_probe(tasks, shutdown, entry.url().to_string());
        }
    }

    fn spawn_probe(&self, tasks: &mut ProbeTasks, shutdown: &CancellationToken, url: String) {
        if !self.probes_enabled || tasks.contains(&url) {
            return;
        }
        tasks.spawn(self.probe.clone(), url, shutdown.child_token());
    }

    fn forget(&self, url: &str) {
        if let Some(metrics) = &self.probe.metrics {
            metrics.forget_backend(url);
        }
    }

    /// Mark silent backends stale and evict the long-silent ones.
    fn sweep(&self) {
        let now = Instant::now();
        let registry = &self.probe.registry;

        let stale = registry.expire_stale(now, self.staleness_timeout);
        let evicted = match self.eviction_timeout {
            Some(timeout) => registry.evict_stale(now, timeout),
            None => Vec::new(),
        };

        if let Some(metrics) = &self.probe.metrics {
            metrics.record_liveness(LivenessEvent::Stale, stale.len());
            metrics.record_liveness(LivenessEvent::Evicted, evicted.len());
            for _ in &stale {
                metrics.record_transition(HealthStatus::Unhealthy);
            }
        }
    }
}

/// Running probe tasks, one slot per backend url.
///
/// Every spawn takes a new generation. A task that stops on its own frees
/// its slot only while the slot still holds its generation, so a task
/// from an earlier registration never frees the slot of a later one.
#[derive(Default)]
struct ProbeTasks {
    set: JoinSet<(String, u64)>,
    slots: HashMap<String, (u64, CancellationToken)>,
    next_generation: u64,
}

impl ProbeTasks {
    fn contains(&self, url: &str) -> bool {
        self.slots.contains_key(url)
    }

    fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn spawn(&mut self, ctx: ProbeContext, url: String, token: CancellationToken) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots.insert(url.clone(), (generation, token.clone()));
        self.set.spawn(async move { (probe_loop(ctx, url, token).await, generation) });
    }

    /// Cancel the task probing `url`. Returns false when there was none.
    fn cancel(&mut self, url: &str) -> bool {
        match self.slots.remove(url) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task whose url is not in `present`, returning those urls.
    fn retain(&mut self, present: &HashSet<&str>) -> Vec<String> {
        let gone: Vec<String> = self
            .slots
            .keys()
            .filter(|url| !present.contains(url.as_str()))
            .cloned()
            .collect();
        for url in &gone {
            self.cancel(url);
        }
        gone
    }

    /// A task finished. Returns true when it freed its slot.
    fn reap(&mut self, url: &str, generation: u64) -> bool {
        let current = self.slots.get(url).is_some_and(|(g, _)| *g == generation);
        if current {
            self.slots.remove(url);
            debug!(url = %url, "probe task exited, slot freed");
        }
        current
    }

    async fn join_next(&mut self) -> Option<Result<(String, u64), JoinError>> {
        self.set.join_next().await
    }

    async fn shutdown(mut self) {
        for (_, token) in self.slots.values() {
            token.cancel();
        }
        while self.set.join_next().await.is_some() {}
    }
}

/// Probe one backend until cancelled or it leaves the registry.
///
/// Returns the url so the supervisor can free the slot.
async fn probe_loop(ctx: ProbeContext, url: String, token: CancellationToken) -> String {
    let mut ticker = interval(ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(url = %url, "probe task started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = ctx.prober.probe(&url) => result,
        };

        // A probe that finished after cancellation must not write
        if token.is_cancelled() {
            break;
        }

        let outcome = match result {
            Ok(()) => {
                debug!(url = %url, "health probe passed");
                ProbeOutcome::Success
            }
            Err(e) => {
                debug!(url = %url, error = %e, "health probe failed");
                ProbeOutcome::Failure
            }
        };

        match ctx.registry.record_probe(&url, outcome, ctx.thresholds) {
            Ok(recorded) => {
                if let Some(metrics) = &ctx.metrics {
                    metrics.record_probe(&url, outcome == ProbeOutcome::Success);
                    if recorded.changed {
                        metrics.record_transition(recorded.status);
                    }
                }
            }
            Err(RegistryError::UnknownBackend(_)) => {
                debug!(url = %url, "backend left the registry, probe stopping");
                break;
            }
            Err(e) => warn!(url = %url, error = %e, "failed to record probe result"),
        }
    }

    debug!(url = %url, "probe task stopped");
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::{Algorithm, Layer, ProbeProtocol};
    use crate::registry::Heartbeat;
    use crate::util::ShutdownSignal;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn fast_config() -> Config {
        let mut config = Config::for_layer(Layer::L4, Algorithm::RoundRobin);
        config.healthcheck.protocol = Some(ProbeProtocol::Tcp);
        config.healthcheck.interval = Duration::from_millis(20);
        config.healthcheck.timeout = Duration::from_millis(200);
        config.healthcheck.staleness_timeout = Some(Duration::from_secs(60));
        config
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Accepts connections and never answers. Reports every accept, and
    /// every connection the peer closed.
    async fn silent_server() -> (
        String,
        mpsc::UnboundedReceiver<()>,
        mpsc::UnboundedReceiver<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = accepted_tx.send(());
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                    let _ = closed_tx.send(());
                });
            }
        });

        (url, accepted_rx, closed_rx)
    }

    #[tokio::test]
    async fn test_failing_backend_marked_unhealthy() {
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(Backend::new("dead", "http://127.0.0.1:1"))
            .unwrap();

        let signal = ShutdownSignal::new();
        let handle = HealthMonitor::new(registry.clone(), &fast_config()).start(&signal.token());

        let demoted = wait_until(|| {
            registry
                .get("http://127.0.0.1:1")
                .is_some_and(|e| e.status() == HealthStatus::Unhealthy)
        })
        .await;
        assert!(demoted);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_registration_after_start_is_probed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let registry = Arc::new(BackendRegistry::new());
        let signal = ShutdownSignal::new();
        let handle = HealthMonitor::new(registry.clone(), &fast_config()).start(&signal.token());

        let url = format!("http://{addr}");
        registry.register(Backend::new("live", url.clone())).unwrap();

        let probed = wait_until(|| {
            registry
                .get(&url)
                .is_some_and(|e| e.health.successes() > 0)
        })
        .await;
        assert!(probed);
        assert!(registry.get(&url).is_some_and(|e| e.is_healthy()));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_halts_probe_writes() {
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(Backend::new("dead", "http://127.0.0.1:1"))
            .unwrap();

        let signal = ShutdownSignal::new();
        let handle = HealthMonitor::new(registry.clone(), &fast_config()).start(&signal.token());
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.stop().await;

        let frozen = registry.get("http://127.0.0.1:1").unwrap().health.clone();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = registry.get("http://127.0.0.1:1").unwrap().health.clone();
        assert_eq!(frozen, after);
    }

    #[tokio::test]
    async fn test_sweep_marks_silent_backends_stale_and_evicts() {
        let mut config = fast_config();
        config.healthcheck.enabled = false;
        config.healthcheck.staleness_timeout = Some(Duration::from_millis(50));
        config.healthcheck.eviction_timeout = Some(Duration::from_millis(150));

        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(Backend::new("quiet", "http://127.0.0.1:9"))
            .unwrap();

        let signal = ShutdownSignal::new();
        let handle = HealthMonitor::new(registry.clone(), &config).start(&signal.token());

        let stale = wait_until(|| {
            registry
                .get("http://127.0.0.1:9")
                .is_some_and(|e| e.health.is_stale() && !e.is_healthy())
        })
        .await;
        assert!(stale);

        let evicted = wait_until(|| registry.is_empty()).await;
        assert!(evicted);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeats_restore_stale_backend_without_probes() {
        let mut config = fast_config();
        config.healthcheck.enabled = false;
        config.healthcheck.staleness_timeout = Some(Duration::from_millis(60));
        let url = "http://127.0.0.1:9";

        let registry = Arc::new(BackendRegistry::new());
        let signal = ShutdownSignal::new();
        let handle = HealthMonitor::new(registry.clone(), &config).start(&signal.token());
        registry.register(Backend::new("quiet", url)).unwrap();

        assert!(wait_until(|| registry.get(url).is_some_and(|e| e.health.is_stale())).await);
        assert!(!registry.get(url).unwrap().is_healthy());

        let pinger = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let _ = registry.heartbeat(Heartbeat::ping(url));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        assert!(
            wait_until(|| registry.get(url).is_some_and(|e| e.is_healthy())).await,
            "heartbeats never restored the backend"
        );
        // Sweeps keep running while heartbeats flow; it must stay eligible
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get(url).unwrap().is_healthy());

        pinger.abort();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_removal_cancels_in_flight_probe() {
        let mut config = fast_config();
        config.healthcheck.protocol = Some(ProbeProtocol::Http);
        config.healthcheck.timeout = Duration::from_secs(5);
        let (url, mut accepted, mut closed) = silent_server().await;
        let metrics = MetricsCollector::new();

        let registry = Arc::new(BackendRegistry::new());
        let signal = ShutdownSignal::new();
        let handle = HealthMonitor::new(registry.clone(), &config)
            .with_metrics(metrics.clone())
            .start(&signal.token());

        registry.register(Backend::new("hung", url.clone())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), accepted.recv())
            .await
            .expect("probe never connected");

        registry.remove(&url).unwrap();

        // Well inside the 5s probe timeout, so only cancellation closes it
        tokio::time::timeout(Duration::from_secs(1), closed.recv())
            .await
            .expect("in-flight probe outlived the backend");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.get(&url).is_none());
        assert!(!metrics.encode().unwrap().contains(url.as_str()));

        // The same url registered again gets a fresh probe task
        registry.register(Backend::new("hung", url.clone())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), accepted.recv())
            .await
            .expect("re-registered backend never probed");
        assert_eq!(registry.get(&url).unwrap().health.last_check(), None);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_exited_task_frees_only_its_own_slot() {
        let registry = Arc::new(BackendRegistry::new());
        let ctx = HealthMonitor::new(registry, &fast_config()).probe;
        let token = CancellationToken::new();
        let url = "http://127.0.0.1:1".to_string();
        let mut tasks = ProbeTasks::default();

        // Not registered, so the task stops after its first probe
        tasks.spawn(ctx.clone(), url.clone(), token.child_token());
        let (done, generation) = tokio::time::timeout(Duration::from_secs(2), tasks.join_next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(done, url);
        assert!(tasks.contains(&url));

        // A newer task for the same url keeps its slot
        tasks.spawn(ctx, url.clone(), token.child_token());
        assert!(!tasks.reap(&done, generation));
        assert!(tasks.contains(&url));

        let (done, generation) = tokio::time::timeout(Duration::from_secs(2), tasks.join_next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tasks.reap(&done, generation));
        assert!(!tasks.contains(&url));

        tasks.shutdown().await;
    }
}
