//! Configuration data types.

use crate::config::serde_time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration structure.
///
/// Layer-specific settings are resolved into [`LayerSettings`] while
/// deserializing, so the rest of the crate never has to look at both
/// `l4_settings` and `l7_settings`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawConfig")]
pub struct Config {
    /// Global settings
    pub global: GlobalConfig,

    /// Selection algorithm
    pub algorithm: Algorithm,

    /// Where the registry protocol listens
    pub listen: ListenConfig,

    /// Active probing and staleness settings
    pub healthcheck: HealthCheckConfig,

    /// Algorithm tuning
    pub selector: SelectorConfig,

    /// Layer and its settings block
    pub settings: LayerSettings,

    /// Metrics exposition
    pub metrics: MetricsConfig,

    /// Lifecycle manager for in-process backends
    pub manager: ManagerConfig,
}

impl Config {
    /// Build a configuration with defaults for everything but layer and algorithm.
    pub fn for_layer(layer: Layer, algorithm: Algorithm) -> Self {
        let settings = match layer {
            Layer::L4 => LayerSettings::L4(L4Settings::default()),
            Layer::L7 => LayerSettings::L7(L7Settings::default()),
        };

        Self {
            global: GlobalConfig::default(),
            algorithm,
            listen: ListenConfig::default(),
            healthcheck: HealthCheckConfig::default(),
            selector: SelectorConfig::default(),
            settings,
            metrics: MetricsConfig::default(),
            manager: ManagerConfig::default(),
        }
    }

    /// The layer this configuration runs at.
    pub fn layer(&self) -> Layer {
        self.settings.layer()
    }
}

/// Wire shape of the configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    global: GlobalConfig,
    layer: Layer,
    #[serde(default)]
    algorithm: Algorithm,
    #[serde(default)]
    listen: ListenConfig,
    #[serde(default)]
    healthcheck: HealthCheckConfig,
    #[serde(default)]
    selector: SelectorConfig,
    #[serde(default)]
    l4_settings: Option<L4Settings>,
    #[serde(default)]
    l7_settings: Option<L7Settings>,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    manager: ManagerConfig,
}

impl TryFrom<RawConfig> for Config {
    type Error = String;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let settings = match (raw.layer, raw.l4_settings, raw.l7_settings) {
            (Layer::L4, _, Some(_)) => {
                return Err("l7_settings given for layer l4".to_string());
            }
            (Layer::L7, Some(_), _) => {
                return Err("l4_settings given for layer l7".to_string());
            }
            (Layer::L4, l4, None) => LayerSettings::L4(l4.unwrap_or_default()),
            (Layer::L7, None, l7) => LayerSettings::L7(l7.unwrap_or_default()),
        };

        Ok(Self {
            global: raw.global,
            algorithm: raw.algorithm,
            listen: raw.listen,
            healthcheck: raw.healthcheck,
            selector: raw.selector,
            settings,
            metrics: raw.metrics,
            manager: raw.manager,
        })
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Network layer the balancer operates at.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    L4,
    L7,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::L4 => f.write_str("l4"),
            Layer::L7 => f.write_str("l7"),
        }
    }
}

/// Backend selection algorithm.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    StickyRoundRobin,
    IpHash,
    UrlHash,
    CookieBased,
    ContentBased,
    LeastTime,
}

impl Algorithm {
    /// Every supported algorithm.
    pub const ALL: [Algorithm; 9] = [
        Algorithm::RoundRobin,
        Algorithm::WeightedRoundRobin,
        Algorithm::LeastConnections,
        Algorithm::StickyRoundRobin,
        Algorithm::IpHash,
        Algorithm::UrlHash,
        Algorithm::CookieBased,
        Algorithm::ContentBased,
        Algorithm::LeastTime,
    ];

    /// Fixed layer compatibility matrix.
    pub fn is_valid_for(self, layer: Layer) -> bool {
        match self {
            Algorithm::RoundRobin | Algorithm::IpHash | Algorithm::LeastTime => true,
            Algorithm::WeightedRoundRobin
            | Algorithm::LeastConnections
            | Algorithm::StickyRoundRobin => layer == Layer::L4,
            Algorithm::UrlHash | Algorithm::CookieBased | Algorithm::ContentBased => {
                layer == Layer::L7
            }
        }
    }

    /// Name as written in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::StickyRoundRobin => "sticky_round_robin",
            Algorithm::IpHash => "ip_hash",
            Algorithm::UrlHash => "url_hash",
            Algorithm::CookieBased => "cookie_based",
            Algorithm::ContentBased => "content_based",
            Algorithm::LeastTime => "least_time",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listen address of the registry protocol.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListenConfig {
    #[serde(default = "default_listen_address")]
    pub address: IpAddr,

    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl ListenConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            port: default_listen_port(),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Whether active probes run
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Probe protocol; derived from the layer when absent
    #[serde(default)]
    pub protocol: Option<ProbeProtocol>,

    /// How often to probe backends
    #[serde(default = "default_health_interval", with = "serde_time::duration")]
    pub interval: Duration,

    /// Timeout for a single probe
    #[serde(default = "default_health_timeout", with = "serde_time::duration")]
    pub timeout: Duration,

    /// HTTP path to probe
    #[serde(default)]
    pub path: Option<String>,

    /// Expected HTTP status code
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,

    /// Consecutive failures before marking unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before marking healthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Heartbeat silence that forces a backend unhealthy
    #[serde(default, with = "serde_time::option_duration")]
    pub staleness_timeout: Option<Duration>,

    /// Heartbeat silence that removes a backend from the registry
    #[serde(default, with = "serde_time::option_duration")]
    pub eviction_timeout: Option<Duration>,
}

impl HealthCheckConfig {
    /// Staleness timeout, three probe intervals unless configured.
    pub fn staleness_timeout(&self) -> Duration {
        self.staleness_timeout.unwrap_or(self.interval * 3)
    }

    /// Probe protocol for the given layer.
    pub fn protocol_for(&self, layer: Layer) -> ProbeProtocol {
        self.protocol.clone().unwrap_or(match layer {
            Layer::L4 => ProbeProtocol::Tcp,
            Layer::L7 => ProbeProtocol::Http,
        })
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: None,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            path: None,
            expected_status: default_expected_status(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            staleness_timeout: None,
            eviction_timeout: None,
        }
    }
}

/// Type of active probe.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    #[default]
    Tcp,
    Http,
}

/// Algorithm tuning knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorConfig {
    /// Smoothing factor for least_time
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    /// Lifetime of a sticky session mapping
    #[serde(default = "default_session_ttl", with = "serde_time::duration")]
    pub session_ttl: Duration,

    /// Virtual nodes per backend on the hash ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: default_ewma_alpha(),
            session_ttl: default_session_ttl(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

/// Layer-specific settings, chosen once at load time.
#[derive(Debug, Clone)]
pub enum LayerSettings {
    L4(L4Settings),
    L7(L7Settings),
}

impl LayerSettings {
    pub fn layer(&self) -> Layer {
        match self {
            LayerSettings::L4(_) => Layer::L4,
            LayerSettings::L7(_) => Layer::L7,
        }
    }
}

/// Layer 4 settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct L4Settings {
    #[serde(default)]
    pub tcp: TcpSettings,
}

/// TCP-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpSettings {
    #[serde(default = "default_true")]
    pub keepalive: bool,

    #[serde(default = "default_keepalive_time", with = "serde_time::duration")]
    pub keepalive_time: Duration,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            keepalive: true,
            keepalive_time: default_keepalive_time(),
            max_connections: default_max_connections(),
        }
    }
}

/// Layer 7 settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct L7Settings {
    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub sticky: StickySettings,

    #[serde(default)]
    pub content: ContentSettings,
}

/// HTTP-specific configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,

    #[serde(default = "default_idle_timeout", with = "serde_time::duration")]
    pub idle_timeout: Duration,

    #[serde(default = "default_write_timeout", with = "serde_time::duration")]
    pub write_timeout: Duration,

    /// Headers to add to requests going to backend
    #[serde(default)]
    pub request_headers: HashMap<String, String>,

    /// Headers to add to responses going to client
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            idle_timeout: default_idle_timeout(),
            write_timeout: default_write_timeout(),
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
        }
    }
}

/// Cookie used by cookie_based affinity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StickySettings {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for StickySettings {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
        }
    }
}

/// Request attribute hashed by content_based.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContentSettings {
    #[serde(default)]
    pub header: Option<String>,
}

/// Metrics exposition on the registry listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address managed backends bind to
    #[serde(default = "default_listen_address")]
    pub address: IpAddr,

    /// First port tried when provisioning
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of ports tried from base_port
    #[serde(default = "default_port_window")]
    pub port_window: u16,

    /// Backends provisioned at startup
    #[serde(default)]
    pub initial_backends: u32,

    #[serde(default = "default_heartbeat_interval", with = "serde_time::duration")]
    pub heartbeat_interval: Duration,

    /// Upper bound on graceful backend shutdown
    #[serde(default = "default_drain_timeout", with = "serde_time::duration")]
    pub drain_timeout: Duration,

    /// Remote registry base URL; the embedded registry is used when absent
    #[serde(default)]
    pub registry_url: Option<String>,

    /// Prefix for generated backend names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_listen_address(),
            base_port: default_base_port(),
            port_window: default_port_window(),
            initial_backends: 0,
            heartbeat_interval: default_heartbeat_interval(),
            drain_timeout: default_drain_timeout(),
            registry_url: None,
            name_prefix: default_name_prefix(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_listen_port() -> u16 {
    10000
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_expected_status() -> u16 {
    200
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_ewma_alpha() -> f64 {
    0.2
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_virtual_nodes() -> u32 {
    160
}

fn default_keepalive_time() -> Duration {
    Duration::from_secs(60)
}

fn default_max_connections() -> u32 {
    10_000
}

fn default_max_header_size() -> usize {
    8192
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cookie_name() -> String {
    "LB_SESSION".to_string()
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_base_port() -> u16 {
    8000
}

fn default_port_window() -> u16 {
    1000
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_name_prefix() -> String {
    "backend".to_string()
}
