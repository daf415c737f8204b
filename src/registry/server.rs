//! Registry HTTP server.
//!
//! Serves the registry protocol:
//! - `POST /register`  - backend descriptor; 200, 400 malformed, 409 duplicate
//! - `POST /heartbeat` - heartbeat body; 200, 400, 404 unknown url
//! - `POST /remove`    - backend descriptor keyed by url; 200, 400, 404
//! - `GET /`           - info text
//! - `GET <metrics>`   - Prometheus text, when enabled

use crate::backend::Backend;
use crate::metrics::MetricsCollector;
use crate::registry::{BackendRegistry, Heartbeat, RegistryError};
use crate::util::ServiceHandle;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Path metrics are served on; swappable while the server runs.
pub type MetricsRoute = Arc<ArcSwapOption<String>>;

/// Shared state for request handlers.
struct ServerContext {
    registry: Arc<BackendRegistry>,
    metrics: Option<MetricsCollector>,
    metrics_path: MetricsRoute,
}

/// Registry protocol server.
///
/// Binding is separate from running so a caller can bind a new address
/// before giving up the old one.
pub struct RegistryServer {
    listener: TcpListener,
    context: ServerContext,
}

impl RegistryServer {
    /// Bind the listener.
    pub async fn bind(address: SocketAddr, registry: Arc<BackendRegistry>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            context: ServerContext {
                registry,
                metrics: None,
                metrics_path: Arc::new(ArcSwapOption::empty()),
            },
        })
    }

    /// Record request metrics, and expose them at `path` when given.
    pub fn with_metrics(mut self, collector: MetricsCollector, path: Option<String>) -> Self {
        self.context.metrics = Some(collector);
        self.context.metrics_path.store(path.map(Arc::new));
        self
    }

    /// Handle for changing the metrics path of the running server.
    pub fn metrics_route(&self) -> MetricsRoute {
        Arc::clone(&self.context.metrics_path)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop under a child token of `parent`.
    pub fn start(self, parent: &CancellationToken) -> ServiceHandle {
        ServiceHandle::spawn("registry-server", parent, move |token| self.run(token))
    }

    /// Run the accept loop until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let address = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!(address = %address, "registry server started");

        let context = Arc::new(self.context);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let context = Arc::clone(&context);
                            let conn_shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let context = Arc::clone(&context);
                                    async move { handle_request(req, &context).await }
                                });

                                let conn = http1::Builder::new().serve_connection(io, service);
                                tokio::pin!(conn);
                                tokio::select! {
                                    result = conn.as_mut() => {
                                        if let Err(e) = result {
                                            debug!(peer = %peer, error = %e, "registry connection error");
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
                            error!(error = %e, "failed to accept registry connection");
                        }
                    }
                }

                _ = shutdown.cancelled() => {
                    info!(address = %address, "registry server shutting down");
                    break;
                }
            }
        }
    }
}

/// Route one request.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    ctx: &ServerContext,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(path = %path, method = %method, "registry request");

    let is_metrics = ctx
        .metrics_path
        .load()
        .as_deref()
        .is_some_and(|p| p.as_str() == path);

    let response = match (path.as_str(), &method) {
        (_, &Method::GET) if is_metrics => metrics_response(ctx),
        ("/", &Method::GET) => info_response(ctx),
        ("/register", &Method::POST) => {
            let response = handle_register(req, ctx).await;
            record(ctx, "register", &response);
            response
        }
        ("/heartbeat", &Method::POST) => {
            let response = handle_heartbeat(req, ctx).await;
            record(ctx, "heartbeat", &response);
            response
        }
        ("/remove", &Method::POST) => {
            let response = handle_remove(req, ctx).await;
            record(ctx, "remove", &response);
            response
        }
        ("/" | "/register" | "/heartbeat" | "/remove", _) => {
            text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
        }
        _ if is_metrics => text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n"),
        _ => text(StatusCode::NOT_FOUND, "Not found\n"),
    };

    Ok(response)
}

async fn handle_register(
    req: Request<hyper::body::Incoming>,
    ctx: &ServerContext,
) -> Response<Full<Bytes>> {
    let backend: Backend = match read_json(req).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };

    match ctx.registry.register(backend) {
        Ok(()) => text(StatusCode::OK, "registered\n"),
        Err(e) => error_response(e),
    }
}

async fn handle_heartbeat(
    req: Request<hyper::body::Incoming>,
    ctx: &ServerContext,
) -> Response<Full<Bytes>> {
    let heartbeat: Heartbeat = match read_json(req).await {
        Ok(heartbeat) => heartbeat,
        Err(response) => return response,
    };

    match ctx.registry.heartbeat(heartbeat) {
        Ok(()) => text(StatusCode::OK, "ok\n"),
        Err(e) => error_response(e),
    }
}

async fn handle_remove(
    req: Request<hyper::body::Incoming>,
    ctx: &ServerContext,
) -> Response<Full<Bytes>> {
    let backend: Backend = match read_json(req).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };

    match ctx.registry.remove(&backend.url) {
        Ok(_) => text(StatusCode::OK, "removed\n"),
        Err(e) => error_response(e),
    }
}

/// Read a size-limited JSON body, or produce the error response.
async fn read_json<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(text(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large\n"));
        }
        Err(e) => {
            warn!(error = %e, "failed to read registry request body");
            return Err(text(StatusCode::BAD_REQUEST, "Invalid request payload\n"));
        }
    };

    serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "malformed registry request");
        text(StatusCode::BAD_REQUEST, format!("Invalid request payload: {e}\n"))
    })
}

fn error_response(err: RegistryError) -> Response<Full<Bytes>> {
    let status = match err {
        RegistryError::UnknownBackend(_) => StatusCode::NOT_FOUND,
        RegistryError::DuplicateBackend(_) => StatusCode::CONFLICT,
        RegistryError::InvalidBackend(_) => StatusCode::BAD_REQUEST,
        RegistryError::Transport(_) | RegistryError::Rejected { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    text(status, format!("{err}\n"))
}

fn info_response(ctx: &ServerContext) -> Response<Full<Bytes>> {
    let mut body = format!(
        "waypoint registry\n\nBackends: {}\n\nEndpoints:\n  POST /register\n  POST /heartbeat\n  POST /remove\n",
        ctx.registry.len()
    );
    if let Some(path) = ctx.metrics_path.load_full() {
        body.push_str(&format!("  GET  {path} - Prometheus metrics\n"));
    }
    text(StatusCode::OK, body)
}

fn metrics_response(ctx: &ServerContext) -> Response<Full<Bytes>> {
    let Some(collector) = &ctx.metrics else {
        return text(StatusCode::NOT_FOUND, "Not found\n");
    };

    collector.observe_snapshot(&ctx.registry.snapshot());
    match collector.encode() {
        Ok(buffer) => {
            let mut response = text(StatusCode::OK, buffer);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n")
        }
    }
}

fn record(ctx: &ServerContext, operation: &str, response: &Response<Full<Bytes>>) {
    if let Some(metrics) = &ctx.metrics {
        metrics.record_registry_request(operation, response.status().as_u16());
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ShutdownSignal;
    use hyper::client::conn::http1 as client_http1;
    use tokio::net::TcpStream;

    async fn start_server(metrics: bool) -> (SocketAddr, Arc<BackendRegistry>, ShutdownSignal) {
        let registry = Arc::new(BackendRegistry::new());
        let mut server = RegistryServer::bind("127.0.0.1:0".parse().unwrap(), registry.clone())
            .await
            .unwrap();
        if metrics {
            server = server.with_metrics(MetricsCollector::new(), Some("/metrics".to_string()));
        }
        let addr = server.local_addr().unwrap();
        let signal = ShutdownSignal::new();
        let token = signal.token();
        tokio::spawn(server.run(token));
        (addr, registry, signal)
    }

    async fn send(addr: SocketAddr, method: Method, path: &str, body: &str) -> (u16, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = client_http1::handshake(TokioIo::new(stream)).await.unwrap();
        tokio::spawn(conn);

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("host", addr.to_string())
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let resp = sender.send_request(req).await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn test_register_status_codes() {
        let (addr, registry, signal) = start_server(false).await;
        let body = r#"{"name":"a","url":"http://127.0.0.1:8001"}"#;

        assert_eq!(send(addr, Method::POST, "/register", body).await.0, 200);
        assert_eq!(send(addr, Method::POST, "/register", body).await.0, 409);
        assert_eq!(send(addr, Method::POST, "/register", "{not json").await.0, 400);
        assert_eq!(send(addr, Method::POST, "/register", r#"{"url":""}"#).await.0, 400);
        assert_eq!(registry.len(), 1);

        signal.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeat_and_remove_status_codes() {
        let (addr, registry, signal) = start_server(false).await;
        let url = "http://127.0.0.1:8001";
        registry.register(Backend::new("a", url)).unwrap();

        let hb = format!(r#"{{"port":8001,"url":"{url}","status":"running","metrics":{{"active_connections":3}}}}"#);
        assert_eq!(send(addr, Method::POST, "/heartbeat", &hb).await.0, 200);
        assert_eq!(
            registry.get(url).unwrap().backend.metrics.active_connections,
            3
        );

        let unknown = r#"{"url":"http://127.0.0.1:9999"}"#;
        assert_eq!(send(addr, Method::POST, "/heartbeat", unknown).await.0, 404);
        assert_eq!(send(addr, Method::POST, "/remove", unknown).await.0, 404);

        let remove = format!(r#"{{"url":"{url}"}}"#);
        assert_eq!(send(addr, Method::POST, "/remove", &remove).await.0, 200);
        assert!(registry.is_empty());

        signal.shutdown();
    }

    #[tokio::test]
    async fn test_method_and_path_errors() {
        let (addr, _registry, signal) = start_server(false).await;

        assert_eq!(send(addr, Method::GET, "/register", "").await.0, 405);
        assert_eq!(send(addr, Method::DELETE, "/remove", "").await.0, 405);
        assert_eq!(send(addr, Method::GET, "/nope", "").await.0, 404);
        assert_eq!(send(addr, Method::GET, "/metrics", "").await.0, 404);

        let (status, body) = send(addr, Method::GET, "/", "").await;
        assert_eq!(status, 200);
        assert!(body.contains("/register"));

        signal.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (addr, registry, signal) = start_server(false).await;
        let huge = format!(r#"{{"url":"http://a","name":"{}"}}"#, "x".repeat(MAX_BODY_BYTES));
        assert_eq!(send(addr, Method::POST, "/register", &huge).await.0, 413);
        assert!(registry.is_empty());
        signal.shutdown();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (addr, registry, signal) = start_server(true).await;
        registry
            .register(Backend::new("a", "http://127.0.0.1:8001"))
            .unwrap();
        send(addr, Method::POST, "/register", r#"{"url":"http://127.0.0.1:8001"}"#).await;

        let (status, body) = send(addr, Method::GET, "/metrics", "").await;
        assert_eq!(status, 200);
        assert!(body.contains("waypoint_backend_healthy"));
        assert!(body.contains(r#"operation="register""#));

        signal.shutdown();
    }

    #[tokio::test]
    async fn test_metrics_route_can_move() {
        let registry = Arc::new(BackendRegistry::new());
        let server = RegistryServer::bind("127.0.0.1:0".parse().unwrap(), registry)
            .await
            .unwrap()
            .with_metrics(MetricsCollector::new(), Some("/metrics".to_string()));
        let addr = server.local_addr().unwrap();
        let route = server.metrics_route();
        let signal = ShutdownSignal::new();
        tokio::spawn(server.run(signal.token()));

        route.store(Some(Arc::new("/stats".to_string())));
        assert_eq!(send(addr, Method::GET, "/metrics", "").await.0, 404);
        assert_eq!(send(addr, Method::GET, "/stats", "").await.0, 200);

        route.store(None);
        assert_eq!(send(addr, Method::GET, "/stats", "").await.0, 404);

        signal.shutdown();
    }
}
