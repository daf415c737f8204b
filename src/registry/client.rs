//! HTTP client for a remote registry.

use crate::backend::Backend;
use crate::registry::{Heartbeat, Registry, RegistryError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`Registry`] implementation that talks to a [`RegistryServer`]
/// over HTTP/1.1, one connection per call.
///
/// [`RegistryServer`]: crate::registry::RegistryServer
#[derive(Debug, Clone)]
pub struct RemoteRegistry {
    /// `host:port` to connect to
    target: String,
    /// Value for the Host header
    authority: String,
    timeout: Duration,
}

impl RemoteRegistry {
    /// Parse `base_url`, e.g. `http://127.0.0.1:10000`.
    pub fn new(base_url: &str) -> Result<Self, RegistryError> {
        let uri: Uri = base_url
            .parse()
            .map_err(|e| RegistryError::Transport(format!("invalid registry url {base_url}: {e}")))?;

        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(RegistryError::Transport(format!(
                "unsupported registry scheme in {base_url}"
            )));
        }

        let authority = uri
            .authority()
            .ok_or_else(|| RegistryError::Transport(format!("registry url has no host: {base_url}")))?;
        let port = authority.port_u16().unwrap_or(80);

        Ok(Self {
            target: format!("{}:{}", authority.host(), port),
            authority: authority.to_string(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Bound each call, connection included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// POST a JSON body and map the status onto the registry contract.
    async fn post<T: Serialize>(&self, path: &str, body: &T, url: &str) -> Result<(), RegistryError> {
        let (status, message) = tokio::time::timeout(self.timeout, self.send(path, body))
            .await
            .map_err(|_| RegistryError::Transport(format!("{path} timed out after {:?}", self.timeout)))??;

        debug!(path, status = status.as_u16(), "registry response");

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::UnknownBackend(url.to_string())),
            StatusCode::CONFLICT => Err(RegistryError::DuplicateBackend(url.to_string())),
            StatusCode::BAD_REQUEST => Err(RegistryError::InvalidBackend(message)),
            other => Err(RegistryError::Rejected {
                status: other.as_u16(),
                message,
            }),
        }
    }

    async fn send<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(StatusCode, String), RegistryError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| RegistryError::InvalidBackend(format!("failed to encode request: {e}")))?;

        let stream = TcpStream::connect(&self.target)
            .await
            .map_err(|e| RegistryError::Transport(format!("connect {}: {e}", self.target)))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| RegistryError::Transport(format!("handshake {}: {e}", self.target)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(error = %e, "registry client connection error");
            }
        });

        let req = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(HOST, &self.authority)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| RegistryError::Transport(format!("build request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RegistryError::Transport(format!("{path}: {e}")))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RegistryError::Transport(format!("{path} response: {e}")))?
            .to_bytes();

        Ok((status, String::from_utf8_lossy(&body).trim().to_string()))
    }
}

#[derive(Serialize)]
struct RemoveRequest<'a> {
    url: &'a str,
}

impl Registry for RemoteRegistry {
    async fn register(&self, backend: Backend) -> Result<(), RegistryError> {
        self.post("/register", &backend, &backend.url).await
    }

    async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<(), RegistryError> {
        self.post("/heartbeat", &heartbeat, &heartbeat.url).await
    }

    async fn remove(&self, url: &str) -> Result<(), RegistryError> {
        self.post("/remove", &RemoveRequest { url }, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BackendRegistry, RegistryServer};
    use crate::util::ShutdownSignal;
    use std::sync::Arc;

    async fn remote() -> (RemoteRegistry, Arc<BackendRegistry>, ShutdownSignal) {
        let registry = Arc::new(BackendRegistry::new());
        let server = RegistryServer::bind("127.0.0.1:0".parse().unwrap(), registry.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let signal = ShutdownSignal::new();
        tokio::spawn(server.run(signal.token()));

        let client = RemoteRegistry::new(&format!("http://{addr}")).unwrap();
        (client, registry, signal)
    }

    #[test]
    fn test_new_parses_base_url() {
        let client = RemoteRegistry::new("http://127.0.0.1:10000").unwrap();
        assert_eq!(client.target, "127.0.0.1:10000");

        let client = RemoteRegistry::new("http://registry.local").unwrap();
        assert_eq!(client.target, "registry.local:80");

        assert!(RemoteRegistry::new("https://registry.local").is_err());
        assert!(RemoteRegistry::new("/no-host").is_err());
    }

    #[tokio::test]
    async fn test_round_trip_through_server() {
        let (client, registry, signal) = remote().await;
        let url = "http://127.0.0.1:8001";

        client.register(Backend::new("a", url)).await.unwrap();
        assert_eq!(registry.len(), 1);

        assert!(matches!(
            client.register(Backend::new("a", url)).await,
            Err(RegistryError::DuplicateBackend(u)) if u == url
        ));

        client.heartbeat(Heartbeat::ping(url)).await.unwrap();

        client.remove(url).await.unwrap();
        assert!(registry.is_empty());

        assert!(matches!(
            client.remove(url).await,
            Err(RegistryError::UnknownBackend(_))
        ));
        assert!(matches!(
            client.heartbeat(Heartbeat::ping(url)).await,
            Err(RegistryError::UnknownBackend(_))
        ));

        signal.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_backend_maps_to_invalid() {
        let (client, _registry, signal) = remote().await;
        assert!(matches!(
            client.register(Backend::new("a", "")).await,
            Err(RegistryError::InvalidBackend(_))
        ));
        signal.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_transport_error() {
        let client = RemoteRegistry::new("http://127.0.0.1:1").unwrap();
        assert!(matches!(
            client.heartbeat(Heartbeat::ping("http://a")).await,
            Err(RegistryError::Transport(_))
        ));
    }

    #[test]
    fn test_watch_is_unsupported() {
        let client = RemoteRegistry::new("http://127.0.0.1:10000").unwrap();
        assert!(client.watch().is_none());
    }
}
