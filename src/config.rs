//! Runtime configuration: TOML file merged over defaults, with CLI flags
//! for the deployment-varying basics.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::errors::{RouterError, RouterResult};
use crate::registry::ShardingMode;
use crate::route::LoadBalancingAlgorithm;

/// Policy for the `X-Forwarded-Client-Cert` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardedClientCert {
    /// Strip whatever arrived and set the gateway-derived value.
    #[default]
    SanitizeSet,
    /// Keep the inbound value only on mutually-authenticated requests.
    Forward,
    /// Keep the inbound value verbatim.
    AlwaysForward,
}

impl ForwardedClientCert {
    pub fn parse(tag: &str) -> Option<ForwardedClientCert> {
        match tag {
            "sanitize_set" => Some(ForwardedClientCert::SanitizeSet),
            "forward" => Some(ForwardedClientCert::Forward),
            "always_forward" => Some(ForwardedClientCert::AlwaysForward),
            _ => None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Layer-7 router for platform application traffic")]
pub struct Cli {
    /// Config file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Listen address for proxied traffic
    #[arg(long)]
    pub listen: Option<String>,

    /// Tracing filter, e.g. "info" or "fleetgate=debug"
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// JSON logs instead of plain
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_health_listen() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_prune_interval_secs() -> u64 {
    30
}

fn default_stale_threshold_secs() -> u64 {
    120
}

fn default_dial_timeout_secs() -> u64 {
    5
}

fn default_endpoint_timeout_secs() -> u64 {
    900
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_load_balance() -> String {
    "round-robin".to_string()
}

fn default_sharding_mode() -> String {
    "all".to_string()
}

fn default_forwarded_client_cert() -> String {
    "sanitize_set".to_string()
}

fn default_true() -> bool {
    true
}

/// On-disk configuration. Unknown keys are rejected so typos fail loudly
/// at startup instead of silently running defaults.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_health_listen")]
    pub health_listen: String,
    #[serde(default)]
    pub metrics_listen: Option<String>,

    #[serde(default = "default_prune_interval_secs")]
    pub prune_stale_droplets_interval_secs: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub droplet_stale_threshold_secs: u64,
    #[serde(default)]
    pub suspend_pruning_if_bus_unavailable: bool,

    #[serde(default = "default_dial_timeout_secs")]
    pub endpoint_dial_timeout_secs: u64,
    #[serde(default = "default_endpoint_timeout_secs")]
    pub endpoint_timeout_secs: u64,
    #[serde(default)]
    pub websocket_dial_timeout_secs: Option<u64>,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default)]
    pub max_conns_per_backend: i64,
    #[serde(default = "default_load_balance")]
    pub load_balance: String,

    #[serde(default = "default_sharding_mode")]
    pub routing_table_sharding_mode: String,
    #[serde(default)]
    pub isolation_segments: Vec<String>,

    #[serde(default)]
    pub empty_pool_timeout_secs: u64,
    #[serde(default)]
    pub empty_pool_response_code_503: bool,

    #[serde(default = "default_forwarded_client_cert")]
    pub forwarded_client_cert: String,
    #[serde(default)]
    pub enable_http2: bool,
    #[serde(default = "default_true")]
    pub keep_alive_100_continue_requests: bool,

    #[serde(default)]
    pub trace_key: String,
    #[serde(default)]
    pub add_response_headers_if_not_present: Vec<(String, String)>,
    #[serde(default)]
    pub remove_response_headers: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config parses")
    }
}

/// Resolved configuration shared across the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub health_listen: SocketAddr,
    pub metrics_listen: Option<SocketAddr>,

    pub prune_stale_droplets_interval: Duration,
    pub droplet_stale_threshold: Duration,
    pub suspend_pruning_if_bus_unavailable: bool,

    pub endpoint_dial_timeout: Duration,
    pub endpoint_timeout: Duration,
    pub websocket_dial_timeout: Duration,
    pub drain_timeout: Duration,

    pub max_conns_per_backend: i64,
    pub load_balance: LoadBalancingAlgorithm,

    pub routing_table_sharding_mode: ShardingMode,
    pub isolation_segments: Vec<String>,

    pub empty_pool_timeout: Duration,
    pub empty_pool_response_code_503: bool,

    pub forwarded_client_cert: ForwardedClientCert,
    pub enable_http2: bool,
    pub keep_alive_100_continue_requests: bool,

    pub trace_key: String,
    pub add_response_headers_if_not_present: Vec<(String, String)>,
    pub remove_response_headers: Vec<String>,
}

impl Config {
    pub fn resolve(file: FileConfig, cli_listen: Option<&str>) -> RouterResult<Config> {
        let listen = cli_listen.unwrap_or(&file.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|e| RouterError::Config(format!("invalid listen address {listen}: {e}")))?;
        let health_listen: SocketAddr = file.health_listen.parse().map_err(|e| {
            RouterError::Config(format!(
                "invalid health listen address {}: {e}",
                file.health_listen
            ))
        })?;
        let metrics_listen = match &file.metrics_listen {
            Some(addr) => Some(addr.parse().map_err(|e| {
                RouterError::Config(format!("invalid metrics listen address {addr}: {e}"))
            })?),
            None => None,
        };

        let sharding_mode = ShardingMode::parse(&file.routing_table_sharding_mode)
            .ok_or_else(|| {
                RouterError::Config(format!(
                    "unknown routing_table_sharding_mode {:?}",
                    file.routing_table_sharding_mode
                ))
            })?;
        let forwarded_client_cert = ForwardedClientCert::parse(&file.forwarded_client_cert)
            .ok_or_else(|| {
                RouterError::Config(format!(
                    "unknown forwarded_client_cert {:?}",
                    file.forwarded_client_cert
                ))
            })?;

        Ok(Config {
            listen,
            health_listen,
            metrics_listen,
            prune_stale_droplets_interval: Duration::from_secs(
                file.prune_stale_droplets_interval_secs,
            ),
            droplet_stale_threshold: Duration::from_secs(file.droplet_stale_threshold_secs),
            suspend_pruning_if_bus_unavailable: file.suspend_pruning_if_bus_unavailable,
            endpoint_dial_timeout: Duration::from_secs(file.endpoint_dial_timeout_secs),
            endpoint_timeout: Duration::from_secs(file.endpoint_timeout_secs),
            websocket_dial_timeout: Duration::from_secs(
                file.websocket_dial_timeout_secs
                    .unwrap_or(file.endpoint_dial_timeout_secs),
            ),
            drain_timeout: Duration::from_secs(file.drain_timeout_secs),
            max_conns_per_backend: file.max_conns_per_backend,
            load_balance: LoadBalancingAlgorithm::parse(&file.load_balance),
            routing_table_sharding_mode: sharding_mode,
            isolation_segments: file.isolation_segments,
            empty_pool_timeout: Duration::from_secs(file.empty_pool_timeout_secs),
            empty_pool_response_code_503: file.empty_pool_response_code_503,
            forwarded_client_cert,
            enable_http2: file.enable_http2,
            keep_alive_100_continue_requests: file.keep_alive_100_continue_requests,
            trace_key: file.trace_key,
            add_response_headers_if_not_present: file.add_response_headers_if_not_present,
            remove_response_headers: file.remove_response_headers,
        })
    }
}

pub fn load_file_config(path: Option<&PathBuf>) -> RouterResult<FileConfig> {
    match path {
        Some(path) => {
            let data = std::fs::read_to_string(path)?;
            toml::from_str(&data).map_err(|e| RouterError::Config(e.to_string()))
        }
        None => Ok(FileConfig::default()),
    }
}
