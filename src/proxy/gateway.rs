//! Pingora `ProxyHttp` implementation for the router.
//!
//! The request path: healthcheck and route lookup in `request_filter`,
//! endpoint selection and peer construction in `upstream_peer`, forwarding
//! headers in `upstream_request_filter`, connect-time retry bookkeeping in
//! `fail_to_connect`, terminal error taxonomy in `fail_to_proxy`, and the
//! access record in `logging`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use pingora_core::prelude::*;
use pingora_core::protocols::ALPN;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::ErrorSource;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use super::headers;
use super::lookup::{
    ErrorResponse, LookupHandler, LookupOutcome, APP_INSTANCE_HEADER, PROCESS_INSTANCE_HEADER,
};
use crate::access_log::{AccessRecord, STATUS_CLIENT_CLOSED_REQUEST};
use crate::config::Config;
use crate::drain::DrainController;
use crate::errors::RouterError;
use crate::metrics;
use crate::registry::RouteRegistry;
use crate::route::{Endpoint, EndpointPool, Protocol, RouteUri, Selection};

/// Healthcheck requests from the platform load balancer carry this
/// user-agent prefix and are answered locally.
const HEALTHCHECK_USER_AGENT_PREFIX: &str = "HTTP-Monitor";

/// Consecutive TLS handshake failures before an endpoint is evicted from
/// the registry. A success resets the streak, so one misconfigured
/// instance cannot poison retries indefinitely.
const TLS_FAILURE_EVICTION_THRESHOLD: u32 = 2;

/// Tracks consecutive TLS handshake failures by backend address.
///
/// Unknown backends have a clean slate; a single success wipes the
/// streak.
pub struct SanFailureTracker {
    failures: DashMap<String, u32>,
}

impl SanFailureTracker {
    pub fn new() -> SanFailureTracker {
        SanFailureTracker {
            failures: DashMap::new(),
        }
    }

    /// Records a failure and returns the streak length including it.
    pub fn record_failure(&self, address: &str) -> u32 {
        let mut count = self.failures.entry(address.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn record_success(&self, address: &str) {
        self.failures.remove(address);
    }

    pub fn failures(&self, address: &str) -> u32 {
        self.failures.get(address).map(|c| *c).unwrap_or(0)
    }
}

/// Per-request context carried across the proxy hooks.
pub struct RouterCtx {
    pub record: AccessRecord,
    started: Instant,
    pool: Option<Arc<EndpointPool>>,
    endpoint: Option<Arc<Endpoint>>,
    attempted: HashSet<String>,
    holds_connection: bool,
    attempt_started: Option<Instant>,
    connected_at: Option<Instant>,
    websocket: bool,
    exhausted: bool,
    request_id: String,
    trace_requested: bool,
    drain_id: Option<u64>,
}

impl Default for RouterCtx {
    fn default() -> Self {
        RouterCtx {
            record: AccessRecord::default(),
            started: Instant::now(),
            pool: None,
            endpoint: None,
            attempted: HashSet::new(),
            holds_connection: false,
            attempt_started: None,
            connected_at: None,
            websocket: false,
            exhausted: false,
            request_id: String::new(),
            trace_requested: false,
            drain_id: None,
        }
    }
}

pub struct RouterProxy {
    config: Arc<Config>,
    registry: Arc<RouteRegistry>,
    lookup: LookupHandler,
    drain: Arc<DrainController>,
    san_tracker: SanFailureTracker,
    router_ip: String,
}

impl RouterProxy {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<RouteRegistry>,
        drain: Arc<DrainController>,
    ) -> RouterProxy {
        let lookup = LookupHandler::new(
            Arc::clone(&registry),
            config.empty_pool_response_code_503,
        );
        let router_ip = config.listen.ip().to_string();
        RouterProxy {
            config,
            registry,
            lookup,
            drain,
            san_tracker: SanFailureTracker::new(),
            router_ip,
        }
    }

    /// Builds the upstream peer for an endpoint: TLS with SAN verification
    /// when the endpoint registered a server cert SAN, ALPN per the
    /// endpoint protocol, and the dial/read deadlines from configuration.
    fn build_peer(&self, endpoint: &Endpoint, websocket: bool) -> Box<HttpPeer> {
        let sni = endpoint.server_cert_domain_san().to_string();
        let mut peer = HttpPeer::new(endpoint.canonical_addr(), endpoint.is_tls(), sni);
        if endpoint.is_tls() {
            peer.options.verify_cert = true;
            peer.options.verify_hostname = true;
        }
        peer.options.alpn = if self.config.enable_http2 && endpoint.protocol == Protocol::Http2 {
            ALPN::H2H1
        } else {
            ALPN::H1
        };
        peer.options.connection_timeout = Some(if websocket {
            self.config.websocket_dial_timeout
        } else {
            self.config.endpoint_dial_timeout
        });
        peer.options.read_timeout = Some(self.config.endpoint_timeout);
        Box::new(peer)
    }

    async fn respond(
        &self,
        session: &mut Session,
        ctx: &mut RouterCtx,
        error: &ErrorResponse,
    ) -> Result<()> {
        ctx.record.status = Some(error.status);
        let mut header = ResponseHeader::build(error.status, None)
            .map_err(|e| RouterError::Http(e.to_string()).into_pg())?;
        header
            .insert_header(headers::ROUTER_ERROR, error.router_error)
            .map_err(|e| RouterError::Http(e.to_string()).into_pg())?;
        header
            .insert_header("Cache-Control", error.cache_control)
            .map_err(|e| RouterError::Http(e.to_string()).into_pg())?;
        headers::ensure_response_request_id(&mut header, &ctx.request_id)?;
        headers::apply_response_rewrites(
            &mut header,
            &self.config.add_response_headers_if_not_present,
            &self.config.remove_response_headers,
        )?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(Bytes::from(error.body.clone())), true)
            .await?;
        Ok(())
    }

    async fn respond_healthcheck(&self, session: &mut Session, ctx: &mut RouterCtx) -> Result<()> {
        let (status, body) = if self.drain.is_draining() {
            (503, Bytes::from_static(b"draining"))
        } else {
            (200, Bytes::from_static(b"ok\n"))
        };
        ctx.record.status = Some(status);
        let mut header = ResponseHeader::build(status, None)
            .map_err(|e| RouterError::Http(e.to_string()).into_pg())?;
        header
            .insert_header("Cache-Control", "private, max-age=0")
            .map_err(|e| RouterError::Http(e.to_string()).into_pg())?;
        header
            .insert_header("Expires", "0")
            .map_err(|e| RouterError::Http(e.to_string()).into_pg())?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session.write_response_body(Some(body), true).await?;
        Ok(())
    }

    /// Releases the connection slot held for the currently selected
    /// endpoint, if any.
    fn release_connection(&self, ctx: &mut RouterCtx) {
        if ctx.holds_connection {
            if let Some(endpoint) = &ctx.endpoint {
                endpoint.stats.decrement_connections();
            }
            ctx.holds_connection = false;
        }
    }

    /// The uri an endpoint's pool is registered under; used to evict a
    /// misbehaving endpoint from the registry.
    fn pool_uri(pool: &EndpointPool) -> RouteUri {
        if pool.context_path() == "/" {
            RouteUri::new(pool.host())
        } else {
            RouteUri::new(format!("{}{}", pool.host(), pool.context_path()))
        }
    }

    fn is_tls_handshake_error(error: &Error) -> bool {
        matches!(
            error.etype(),
            ErrorType::TLSHandshakeFailure
                | ErrorType::TLSHandshakeTimedout
                | ErrorType::InvalidCert
        )
    }
}

#[async_trait]
impl ProxyHttp for RouterProxy {
    type CTX = RouterCtx;

    fn new_ctx(&self) -> Self::CTX {
        let mut ctx = RouterCtx::default();
        ctx.request_id = uuid::Uuid::new_v4().to_string();
        ctx
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        ctx.started = Instant::now();
        ctx.drain_id = Some(self.drain.track_active());
        ctx.record.remote_addr = session.client_addr().map(|a| a.to_string());
        ctx.record.vcap_request_id = Some(ctx.request_id.clone());

        // Everything needed from the request head is copied out up front;
        // the session is borrowed mutably below to write early responses.
        let (host, path, app_instance, process_instance);
        {
            let req = session.req_header();
            ctx.record.method = req.method.to_string();
            ctx.record.path = req.uri.path().to_string();
            ctx.record.http_version = format!("{:?}", req.version);
            ctx.record.referer = header_string(req, "Referer");
            ctx.record.user_agent = header_string(req, "User-Agent");
            ctx.record.x_forwarded_for = header_string(req, "X-Forwarded-For");
            ctx.record.x_forwarded_proto = header_string(req, "X-Forwarded-Proto");
            ctx.websocket = headers::is_upgrade_request(req);
            ctx.trace_requested = !self.config.trace_key.is_empty()
                && header_string(req, headers::VCAP_TRACE).as_deref()
                    == Some(self.config.trace_key.as_str());

            host = extract_host(
                header_string(req, "Host").as_deref(),
                req.uri.authority().map(|a| a.as_str()),
            );
            path = req.uri.path().to_string();
            app_instance = header_string(req, APP_INSTANCE_HEADER);
            process_instance = header_string(req, PROCESS_INSTANCE_HEADER);
        }
        ctx.record.host = host.clone();

        let user_agent = ctx.record.user_agent.clone().unwrap_or_default();
        if user_agent.starts_with(HEALTHCHECK_USER_AGENT_PREFIX) {
            self.respond_healthcheck(session, ctx).await?;
            return Ok(true);
        }

        let client_ip = ctx.record.remote_addr.as_deref().map(strip_port);

        let outcome = self.lookup.lookup(
            &host,
            &path,
            client_ip.as_deref(),
            app_instance.as_deref(),
            process_instance.as_deref(),
        );

        match outcome {
            LookupOutcome::Route(pool) => {
                ctx.pool = Some(pool);
                // Request bodies are buffered until first use so a
                // connect-time failure can replay them on a fresh
                // endpoint.
                session.as_downstream_mut().enable_retry_buffering();
                Ok(false)
            }
            LookupOutcome::Reject(error) => {
                self.respond(session, ctx, &error).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let pool = ctx
            .pool
            .clone()
            .ok_or_else(|| Error::explain(ErrorType::HTTPStatus(404), "no route pool bound"))?;

        match pool.next_endpoint_excluding(&ctx.attempted) {
            Selection::Available(endpoint) => {
                ctx.attempted.insert(endpoint.identity());
                self.release_connection(ctx);
                endpoint.stats.increment_connections();
                ctx.holds_connection = true;

                ctx.record.backend_addr = Some(endpoint.canonical_addr());
                ctx.record.app_id = Some(endpoint.application_id.clone());
                ctx.record.app_index = Some(endpoint.private_instance_index.clone());
                ctx.record.instance_id = Some(endpoint.private_instance_id.clone());
                ctx.attempt_started = Some(Instant::now());

                let peer = self.build_peer(&endpoint, ctx.websocket);
                ctx.endpoint = Some(endpoint);
                Ok(peer)
            }
            Selection::AllBusy => {
                ctx.exhausted = true;
                metrics::BACKEND_EXHAUSTED_CONNS.inc();
                Err(Error::explain(
                    ErrorType::HTTPStatus(503),
                    "all endpoints at connection capacity",
                ))
            }
            Selection::Empty => {
                metrics::ENDPOINT_FAILURES.inc();
                Err(Error::explain(
                    ErrorType::HTTPStatus(502),
                    "no endpoints left to try",
                ))
            }
        }
    }

    async fn connected_to_upstream(
        &self,
        _session: &mut Session,
        reused: bool,
        peer: &HttpPeer,
        _fd: std::os::unix::io::RawFd,
        digest: Option<&pingora_core::protocols::Digest>,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let now = Instant::now();
        ctx.connected_at = Some(now);
        if let Some(started) = ctx.attempt_started {
            ctx.record.dial_time = Some(now.duration_since(started));
        }
        if !reused {
            if let Some(digest) = digest {
                ctx.record.tls_time = tls_handshake_time(digest);
            }
        }
        if peer.is_tls() {
            if let Some(endpoint) = &ctx.endpoint {
                self.san_tracker.record_success(&endpoint.canonical_addr());
            }
        }
        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let client_ip = session
            .client_addr()
            .map(|a| strip_port(&a.to_string()))
            .unwrap_or_default();
        let tls_ingress = session
            .as_downstream()
            .digest()
            .and_then(|d| d.ssl_digest.as_ref())
            .is_some();

        headers::append_forwarded_for(upstream_request, &client_ip)?;
        headers::set_forwarded_proto(
            upstream_request,
            if tls_ingress { "https" } else { "http" },
        )?;
        headers::append_request_start(upstream_request)?;
        headers::set_vcap_request_id(upstream_request, &ctx.request_id)?;
        headers::strip_accept_encoding(upstream_request);
        if let Some(endpoint) = &ctx.endpoint {
            headers::set_instance_id(upstream_request, endpoint)?;
        }
        // mTLS identity is only derivable from a TLS ingress connection.
        let client_cert = None;
        headers::apply_forwarded_client_cert(
            upstream_request,
            self.config.forwarded_client_cert,
            client_cert,
        )?;

        if !self.config.keep_alive_100_continue_requests
            && upstream_request.headers.get("Expect").is_some()
        {
            headers::force_connection_close(upstream_request)?;
        }
        Ok(())
    }

    fn fail_to_connect(
        &self,
        session: &mut Session,
        peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        self.release_connection(ctx);

        ctx.record.failed_attempts += 1;
        if let Some(started) = ctx.attempt_started.take() {
            let spent = started.elapsed();
            ctx.record.failed_attempts_time =
                Some(ctx.record.failed_attempts_time.unwrap_or_default() + spent);
        }

        if let (Some(endpoint), Some(pool)) = (&ctx.endpoint, &ctx.pool) {
            pool.mark_failed(endpoint);

            if peer.is_tls() && Self::is_tls_handshake_error(&e) {
                let streak = self.san_tracker.record_failure(&endpoint.canonical_addr());
                if streak >= TLS_FAILURE_EVICTION_THRESHOLD {
                    tracing::warn!(
                        target: "proxy",
                        backend = %endpoint.canonical_addr(),
                        streak,
                        "evicting endpoint after repeated TLS handshake failures"
                    );
                    self.registry
                        .unregister(&Self::pool_uri(pool), endpoint.as_ref());
                }
            }

            let untried = pool.len() > ctx.attempted.len();
            let body_replayable = !session.as_downstream().retry_buffer_truncated();
            if untried && body_replayable {
                e.set_retry(true);
            }
        }
        e
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        headers::ensure_response_request_id(upstream_response, &ctx.request_id)?;
        if ctx.trace_requested {
            if let Some(endpoint) = &ctx.endpoint {
                headers::set_trace_headers(
                    upstream_response,
                    &endpoint.canonical_addr(),
                    &self.router_ip,
                )?;
            }
        }
        headers::apply_response_rewrites(
            upstream_response,
            &self.config.add_response_headers_if_not_present,
            &self.config.remove_response_headers,
        )?;
        Ok(())
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16 {
        // A client that went away gets nothing; the access record keeps
        // the 499.
        if matches!(e.esource(), ErrorSource::Downstream) {
            ctx.record.status = Some(STATUS_CLIENT_CLOSED_REQUEST);
            return 0;
        }
        // A failure after response bytes reached the client cannot be
        // repaired; the connection is torn down instead.
        if session.response_written().is_some() {
            return 0;
        }

        let (status, router_error) = if ctx.exhausted {
            (503, "backend_exhausted_conns")
        } else {
            match e.etype() {
                ErrorType::HTTPStatus(404) => (404, "unknown_route"),
                ErrorType::HTTPStatus(code) => (*code, "endpoint_failure"),
                _ => {
                    metrics::ENDPOINT_FAILURES.inc();
                    (502, "endpoint_failure")
                }
            }
        };
        let body = if status == 502 {
            "502 Bad Gateway: Registered endpoint failed to handle the request.\n".to_string()
        } else {
            String::new()
        };

        let error = ErrorResponse {
            status,
            router_error,
            cache_control: "no-cache, no-store",
            body,
        };
        if self.respond(session, ctx, &error).await.is_err() {
            return 0;
        }
        status
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        self.release_connection(ctx);

        let written = session.response_written().map(|r| r.status.as_u16());
        if let Some(status) = written {
            ctx.record.status = Some(status);
        }
        ctx.record.bytes_sent = session.as_downstream().body_bytes_sent();

        if e.is_some() && ctx.record.status.is_none() {
            ctx.record.status = Some(STATUS_CLIENT_CLOSED_REQUEST);
        }

        let upgraded = ctx.record.status == Some(101);
        if upgraded {
            metrics::WEBSOCKET_UPGRADES.inc();
        }
        if let Some(id) = ctx.drain_id.take() {
            if upgraded {
                self.drain.mark_hijacked(id);
            } else {
                self.drain.mark_closed(id);
            }
        }

        if let Some(connected_at) = ctx.connected_at {
            ctx.record.backend_time = Some(connected_at.elapsed());
        }
        ctx.record.finish(ctx.started.elapsed());
        ctx.record.emit();
    }
}

fn header_string(req: &RequestHeader, name: &str) -> Option<String> {
    req.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Host for routing: the `Host` header, falling back to the uri authority
/// for HTTP/2; the port is stripped either way.
pub fn extract_host(host_header: Option<&str>, authority: Option<&str>) -> String {
    let raw = host_header.or(authority).unwrap_or("");
    strip_port(raw)
}

/// Strips a `:port` suffix, tolerating bracketed IPv6 literals.
pub fn strip_port(address: &str) -> String {
    if address.starts_with('[') {
        if let Some(end) = address.find(']') {
            return address[1..end].to_string();
        }
    }
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => {
            host.to_string()
        }
        _ => address.to_string(),
    }
}

/// TLS handshake duration from the per-layer timing digest: time between
/// the TCP layer establishing and the TLS layer establishing.
fn tls_handshake_time(digest: &pingora_core::protocols::Digest) -> Option<Duration> {
    let mut established: Vec<SystemTime> = digest
        .timing_digest
        .iter()
        .flatten()
        .map(|t| t.established_ts)
        .collect();
    if established.len() < 2 {
        return None;
    }
    established.sort();
    established
        .last()?
        .duration_since(*established.first()?)
        .ok()
}
