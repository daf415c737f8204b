//! Active probes.
//!
//! A TCP probe connects and closes. An HTTP probe sends `GET path` and
//! compares the status code. Both are bounded by the configured timeout.

use crate::config::{HealthCheckConfig, Layer, ProbeProtocol};
use hyper::Uri;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Why a probe failed. Consumed by the health state machine.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe target: {0}")]
    InvalidTarget(String),

    #[error("connection failed: {0}")]
    Connect(std::io::Error),

    #[error("probe timeout after {0:?}")]
    Timeout(Duration),

    #[error("write failed: {0}")]
    Write(std::io::Error),

    #[error("read failed: {0}")]
    Read(std::io::Error),

    #[error("empty response")]
    EmptyResponse,

    #[error("invalid HTTP response")]
    InvalidResponse,

    #[error("unexpected status: {got} (expected {expected})")]
    UnexpectedStatus { got: u16, expected: u16 },
}

/// Probe settings resolved for one layer.
#[derive(Debug, Clone)]
pub struct Prober {
    protocol: ProbeProtocol,
    path: String,
    expected_status: u16,
    timeout: Duration,
}

impl Prober {
    pub fn new(config: &HealthCheckConfig, layer: Layer) -> Self {
        Self {
            protocol: config.protocol_for(layer),
            path: config.path.clone().unwrap_or_else(|| "/".to_string()),
            expected_status: config.expected_status,
            timeout: config.timeout,
        }
    }

    pub fn protocol(&self) -> &ProbeProtocol {
        &self.protocol
    }

    /// Probe the backend behind `url`.
    pub async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let (authority, target) = probe_target(url)?;

        let attempt = async {
            match self.protocol {
                ProbeProtocol::Tcp => tcp_health_check(&target).await,
                ProbeProtocol::Http => {
                    http_health_check(&target, &authority, &self.path, self.expected_status).await
                }
            }
        };

        match timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

/// Resolve a backend url into its Host header value and a `host:port`
/// connect target.
fn probe_target(url: &str) -> Result<(String, String), ProbeError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| ProbeError::InvalidTarget(url.to_string()))?;

    let host = uri
        .host()
        .ok_or_else(|| ProbeError::InvalidTarget(url.to_string()))?;

    let port = match (uri.port_u16(), uri.scheme_str()) {
        (Some(port), _) => port,
        (None, Some("https")) => 443,
        (None, Some("http")) => 80,
        _ => return Err(ProbeError::InvalidTarget(url.to_string())),
    };

    let authority = uri
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_else(|| host.to_string());

    Ok((authority, format!("{host}:{port}")))
}

/// Connect and close.
async fn tcp_health_check(target: &str) -> Result<(), ProbeError> {
    TcpStream::connect(target)
        .await
        .map(drop)
        .map_err(ProbeError::Connect)
}

/// Send `GET path` and compare the response status.
async fn http_health_check(
    target: &str,
    authority: &str,
    path: &str,
    expected_status: u16,
) -> Result<(), ProbeError> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(ProbeError::Connect)?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: waypoint-probe\r\nConnection: close\r\n\r\n",
        path, authority
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(ProbeError::Write)?;

    // The status line fits comfortably in the first read
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.map_err(ProbeError::Read)?;
    if n == 0 {
        return Err(ProbeError::EmptyResponse);
    }

    let response = String::from_utf8_lossy(&buf[..n]);
    let status = parse_http_status(&response)?;

    if status == expected_status {
        Ok(())
    } else {
        Err(ProbeError::UnexpectedStatus {
            got: status,
            expected: expected_status,
        })
    }
}

/// Parse the status code from "HTTP/1.1 200 OK\r\n...".
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    let mut parts = response.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse().map_err(|_| ProbeError::InvalidResponse)
        }
        _ => Err(ProbeError::InvalidResponse),
    }
}
