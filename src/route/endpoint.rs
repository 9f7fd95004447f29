//! Backend endpoint identity and per-endpoint stats.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Application protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Http1,
    Http2,
}

impl Protocol {
    /// Parses a registration protocol tag. Unknown tags collapse to http1.
    pub fn parse(tag: &str) -> Protocol {
        match tag {
            "http2" => Protocol::Http2,
            _ => Protocol::Http1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
        }
    }
}

/// Live counters shared between re-registrations of the same endpoint.
///
/// A re-registration replaces the [`Endpoint`] value but carries these
/// over, so in-flight connection counts survive config refreshes.
#[derive(Debug, Default)]
pub struct EndpointStats {
    number_connections: AtomicI64,
}

impl EndpointStats {
    pub fn increment_connections(&self) {
        self.number_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero; the gauge must never go negative even if a
    /// release races a double-close.
    pub fn decrement_connections(&self) {
        let mut current = self.number_connections.load(Ordering::Relaxed);
        while current > 0 {
            match self.number_connections.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn connections(&self) -> i64 {
        self.number_connections.load(Ordering::Relaxed)
    }
}

/// Construction options for [`Endpoint`]. Only the fields a registration
/// carries need to be set; the rest default to empty.
#[derive(Debug, Default, Clone)]
pub struct EndpointOpts {
    pub host: String,
    pub port: u16,
    pub tls_port: u16,
    pub server_cert_domain_san: String,
    pub app_id: String,
    pub private_instance_id: String,
    pub private_instance_index: String,
    pub process_id: String,
    pub isolation_segment: String,
    pub route_service_url: String,
    pub protocol: Protocol,
    pub stale_threshold: Duration,
}

/// An addressable backend instance.
///
/// Identity is `(canonical_addr, private_instance_id)`. The dial target is
/// the TLS port exactly when a server cert SAN was registered; otherwise
/// the plain port.
#[derive(Debug, Clone)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls_port: u16,
    server_cert_domain_san: String,
    pub application_id: String,
    pub private_instance_id: String,
    pub private_instance_index: String,
    pub process_id: String,
    pub isolation_segment: String,
    pub route_service_url: String,
    pub protocol: Protocol,
    pub stale_threshold: Duration,
    pub stats: Arc<EndpointStats>,
}

impl Endpoint {
    pub fn new(opts: EndpointOpts) -> Endpoint {
        Endpoint {
            host: opts.host,
            port: opts.port,
            tls_port: opts.tls_port,
            server_cert_domain_san: opts.server_cert_domain_san,
            application_id: opts.app_id,
            private_instance_id: opts.private_instance_id,
            private_instance_index: opts.private_instance_index,
            process_id: opts.process_id,
            isolation_segment: opts.isolation_segment,
            route_service_url: opts.route_service_url,
            protocol: opts.protocol,
            stale_threshold: opts.stale_threshold,
            stats: Arc::new(EndpointStats::default()),
        }
    }

    pub fn is_tls(&self) -> bool {
        !self.server_cert_domain_san.is_empty()
    }

    pub fn server_cert_domain_san(&self) -> &str {
        &self.server_cert_domain_san
    }

    /// The port this endpoint is dialed on.
    pub fn dial_port(&self) -> u16 {
        if self.is_tls() {
            self.tls_port
        } else {
            self.port
        }
    }

    /// `ip:port` of the dial target.
    pub fn canonical_addr(&self) -> String {
        format!("{}:{}", self.host, self.dial_port())
    }

    /// Identity key within a pool.
    pub fn identity(&self) -> String {
        format!("{}|{}", self.canonical_addr(), self.private_instance_id)
    }

    /// Value for the `X-CF-InstanceID` header.
    pub fn instance_header_value(&self) -> String {
        if self.private_instance_id.is_empty() {
            self.canonical_addr()
        } else {
            self.private_instance_id.clone()
        }
    }

    /// Whether a replacement registration changes any configured field.
    /// Used to classify a pool put as UPDATED vs UNCHANGED.
    pub fn equivalent(&self, other: &Endpoint) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.tls_port == other.tls_port
            && self.server_cert_domain_san == other.server_cert_domain_san
            && self.application_id == other.application_id
            && self.private_instance_id == other.private_instance_id
            && self.private_instance_index == other.private_instance_index
            && self.process_id == other.process_id
            && self.isolation_segment == other.isolation_segment
            && self.route_service_url == other.route_service_url
            && self.protocol == other.protocol
    }

    /// Re-registration: keep the live stats of the endpoint being replaced.
    pub fn adopt_stats(&mut self, previous: &Endpoint) {
        self.stats = Arc::clone(&previous.stats);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_addr())
    }
}
