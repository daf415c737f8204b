//! In-process HTTP backend provisioned by the lifecycle manager.

use crate::backend::ServerMetrics;
use crate::util::ServiceHandle;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters a backend server keeps about its own traffic.
#[derive(Debug)]
pub struct ServerStats {
    started: Instant,
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    request_count: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    total_response_nanos: AtomicU64,
    last_response_nanos: AtomicU64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            total_response_nanos: AtomicU64::new(0),
            last_response_nanos: AtomicU64::new(0),
        }
    }
}

impl ServerStats {
    fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard(Arc::clone(self))
    }

    fn record_request(&self, received: u64, sent: u64, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.total_response_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.last_response_nanos.store(nanos, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Metrics as reported in heartbeats.
    pub fn sample(&self) -> ServerMetrics {
        let requests = self.request_count();
        let total_connections = self.total_connections.load(Ordering::Relaxed);
        let total_nanos = self.total_response_nanos.load(Ordering::Relaxed);
        let uptime = self.started.elapsed().as_secs_f64();

        ServerMetrics {
            active_connections: self.active_connections(),
            total_connections,
            connection_rate: if uptime > 0.0 {
                total_connections as f64 / uptime
            } else {
                0.0
            },
            response_time: Duration::from_nanos(total_nanos.checked_div(requests).unwrap_or(0)),
            last_response_time: Duration::from_nanos(self.last_response_nanos.load(Ordering::Relaxed)),
            request_count: requests,
            successful_requests: requests,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            ..ServerMetrics::default()
        }
    }
}

struct ConnectionGuard(Arc<ServerStats>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A running backend server.
pub struct BackendServer {
    port: u16,
    stats: Arc<ServerStats>,
    handle: ServiceHandle,
}

impl BackendServer {
    /// Serve on an already bound listener.
    pub fn start(
        listener: TcpListener,
        port: u16,
        drain_timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let stats = Arc::new(ServerStats::default());
        let task_stats = Arc::clone(&stats);
        let handle = ServiceHandle::spawn("backend-server", parent, move |token| {
            serve(listener, port, task_stats, drain_timeout, token)
        });
        Self {
            port,
            stats,
            handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop accepting, drain open connections, then abort what is left.
    pub async fn stop(self) {
        self.handle.stop().await;
    }
}

async fn serve(
    listener: TcpListener,
    port: u16,
    stats: Arc<ServerStats>,
    drain_timeout: Duration,
    shutdown: CancellationToken,
) {
    info!(port, "backend server started");
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        let guard = stats.connection_opened();
                        let stats = Arc::clone(&stats);
                        let conn_shutdown = shutdown.clone();

                        connections.spawn(async move {
                            let _guard = guard;
                            let service = service_fn(move |req| {
                                let stats = Arc::clone(&stats);
                                async move { handle_request(req, port, &stats) }
                            });

                            let conn = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service);
                            tokio::pin!(conn);
                            tokio::select! {
                                result = conn.as_mut() => {
                                    if let Err(e) = result {
                                        debug!(port, peer = %peer, error = %e, "backend connection error");
                                    }
                                }
                                _ = conn_shutdown.cancelled() => {
                                    conn.as_mut().graceful_shutdown();
                                    let _ = conn.await;
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(port, error = %e, "failed to accept backend connection");
                    }
                }
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            _ = shutdown.cancelled() => {
                break;
            }
        }
    }

    drop(listener);
    let open = connections.len();
    let drained = tokio::time::timeout(drain_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    match drained {
        Ok(()) => info!(port, open, "backend server drained"),
        Err(_) => {
            warn!(
                port,
                remaining = connections.len(),
                timeout = ?drain_timeout,
                "drain timed out, aborting connections"
            );
            connections.abort_all();
        }
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    port: u16,
    stats: &ServerStats,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let received = req.body().size_hint().exact().unwrap_or(0);

    let body = Bytes::from(format!("Server running on port {port}\n"));
    let sent = body.len() as u64;
    let response = Response::new(Full::new(body));

    stats.record_request(received, sent, started.elapsed());
    Ok(response)
}
