//! Host and instance-header validation, and the registry lookup decision.
//!
//! Runs before anything is dialed: either a pool comes back for the proxy
//! to iterate, or a precise error response short-circuits the request.

use std::sync::Arc;

use crate::metrics;
use crate::registry::RouteRegistry;
use crate::route::{EndpointPool, PoolCapacity, RouteUri};

pub const APP_INSTANCE_HEADER: &str = "X-CF-App-Instance";
pub const PROCESS_INSTANCE_HEADER: &str = "X-CF-Process-Instance";

/// A short-circuit response: status, `X-Cf-RouterError` token,
/// cache-control, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u16,
    pub router_error: &'static str,
    pub cache_control: &'static str,
    pub body: String,
}

#[derive(Debug)]
pub enum LookupOutcome {
    Route(Arc<EndpointPool>),
    Reject(ErrorResponse),
}

/// `appGUID:index`, exactly one colon, both parts non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInstance {
    pub app_id: String,
    pub index: String,
}

pub fn parse_app_instance(value: &str) -> Option<AppInstance> {
    let mut parts = value.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(app_id), Some(index), None) if !app_id.is_empty() && !index.is_empty() => {
            Some(AppInstance {
                app_id: app_id.to_string(),
                index: index.to_string(),
            })
        }
        _ => None,
    }
}

/// `processGUID` or `processGUID:index`; empty parts or a third segment
/// are invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInstance {
    pub process_id: String,
    pub index: Option<String>,
}

pub fn parse_process_instance(value: &str) -> Option<ProcessInstance> {
    let mut parts = value.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(process_id), None, _) if !process_id.is_empty() => Some(ProcessInstance {
            process_id: process_id.to_string(),
            index: None,
        }),
        (Some(process_id), Some(index), None) if !process_id.is_empty() && !index.is_empty() => {
            Some(ProcessInstance {
                process_id: process_id.to_string(),
                index: Some(index.to_string()),
            })
        }
        _ => None,
    }
}

pub struct LookupHandler {
    registry: Arc<RouteRegistry>,
    empty_pool_response_code_503: bool,
}

impl LookupHandler {
    pub fn new(registry: Arc<RouteRegistry>, empty_pool_response_code_503: bool) -> LookupHandler {
        LookupHandler {
            registry,
            empty_pool_response_code_503,
        }
    }

    /// Decides the fate of a request from its host, path, source ip and
    /// instance headers. Captures the rejection metrics as it goes.
    pub fn lookup(
        &self,
        host: &str,
        path: &str,
        client_ip: Option<&str>,
        app_instance_header: Option<&str>,
        process_instance_header: Option<&str>,
    ) -> LookupOutcome {
        if host.is_empty() || client_ip.is_some_and(|ip| ip == host) {
            metrics::BAD_REQUESTS.inc();
            return LookupOutcome::Reject(ErrorResponse {
                status: 400,
                router_error: "empty_host",
                cache_control: "public,max-age=2",
                body: "Request had empty Host header\n".to_string(),
            });
        }

        let app_instance = match app_instance_header {
            Some(value) => match parse_app_instance(value) {
                Some(parsed) => Some(parsed),
                None => {
                    metrics::BAD_REQUESTS.inc();
                    return LookupOutcome::Reject(ErrorResponse {
                        status: 400,
                        router_error: "invalid_cf_app_instance_header",
                        cache_control: "no-cache, no-store",
                        body: "400 Bad Request: Invalid X-CF-App-Instance Header\n".to_string(),
                    });
                }
            },
            None => None,
        };

        let process_instance = match process_instance_header {
            Some(value) => match parse_process_instance(value) {
                Some(parsed) => Some(parsed),
                None => {
                    metrics::BAD_REQUESTS.inc();
                    return LookupOutcome::Reject(ErrorResponse {
                        status: 400,
                        router_error: "invalid_cf_process_instance_header",
                        cache_control: "no-cache, no-store",
                        body: "400 Bad Request: Invalid X-CF-Process-Instance Header\n".to_string(),
                    });
                }
            },
            None => None,
        };

        let uri = RouteUri::new(format!("{host}{path}"));

        // The process header wins when both are present.
        let pool = if let Some(process) = &process_instance {
            self.registry.lookup_with_process_instance(
                &uri,
                &process.process_id,
                process.index.as_deref().unwrap_or(""),
            )
        } else if let Some(app) = &app_instance {
            self.registry
                .lookup_with_app_instance(&uri, &app.app_id, &app.index)
        } else {
            self.registry.lookup(&uri)
        };

        let pool = match pool {
            Some(pool) => pool,
            None => {
                return self.not_found(host, app_instance.as_ref(), process_instance.as_ref())
            }
        };

        // Occupancy probe only; the proxy engine makes the one
        // cursor-advancing selection per attempt.
        match pool.capacity_state() {
            PoolCapacity::Available => LookupOutcome::Route(pool),
            PoolCapacity::AllBusy => {
                metrics::BACKEND_EXHAUSTED_CONNS.inc();
                LookupOutcome::Reject(ErrorResponse {
                    status: 503,
                    router_error: "backend_exhausted_conns",
                    cache_control: "no-cache, no-store",
                    body: format!(
                        "Requested route ('{host}') has no available endpoints\n"
                    ),
                })
            }
            PoolCapacity::Empty => self.empty_pool(host),
        }
    }

    fn not_found(
        &self,
        host: &str,
        app_instance: Option<&AppInstance>,
        process_instance: Option<&ProcessInstance>,
    ) -> LookupOutcome {
        metrics::BAD_REQUESTS.inc();
        let (status, body) = if let Some(process) = process_instance {
            match &process.index {
                Some(index) => (
                    400,
                    format!(
                        "Requested instance ('{index}') with process guid ('{}') does not exist for route ('{host}')\n",
                        process.process_id
                    ),
                ),
                None => (
                    400,
                    format!(
                        "Requested instance with process guid ('{}') does not exist for route ('{host}')\n",
                        process.process_id
                    ),
                ),
            }
        } else if let Some(app) = app_instance {
            (
                400,
                format!(
                    "Requested instance ('{}') with guid ('{}') does not exist for route ('{host}')\n",
                    app.index, app.app_id
                ),
            )
        } else {
            (
                404,
                format!("Requested route ('{host}') does not exist\n"),
            )
        };
        LookupOutcome::Reject(ErrorResponse {
            status,
            router_error: "unknown_route",
            cache_control: "no-cache, no-store",
            body,
        })
    }

    /// A route key exists but holds no endpoints. Behind the 503 flag this
    /// is its own taxonomy entry; without it the case funnels through the
    /// unknown-route response.
    fn empty_pool(&self, host: &str) -> LookupOutcome {
        if self.empty_pool_response_code_503 {
            LookupOutcome::Reject(ErrorResponse {
                status: 503,
                router_error: "no_endpoints",
                cache_control: "public,max-age=2",
                body: format!("Requested route ('{host}') has no available endpoints\n"),
            })
        } else {
            self.not_found(host, None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOpts;
    use crate::route::{Endpoint, EndpointOpts};

    fn registry() -> Arc<RouteRegistry> {
        Arc::new(RouteRegistry::new(RegistryOpts::default()))
    }

    fn registry_with_caps(max_conns: i64) -> Arc<RouteRegistry> {
        Arc::new(RouteRegistry::new(RegistryOpts {
            max_conns_per_backend: max_conns,
            ..Default::default()
        }))
    }

    fn endpoint(host: &str, port: u16, app_id: &str, index: &str) -> Endpoint {
        Endpoint::new(EndpointOpts {
            host: host.to_string(),
            port,
            app_id: app_id.to_string(),
            private_instance_index: index.to_string(),
            private_instance_id: format!("{host}:{port}"),
            ..Default::default()
        })
    }

    fn reject(outcome: LookupOutcome) -> ErrorResponse {
        match outcome {
            LookupOutcome::Reject(e) => e,
            LookupOutcome::Route(_) => panic!("expected a rejection"),
        }
    }

    // ========== Instance header parsing ==========

    #[test]
    fn test_parse_app_instance_valid() {
        let parsed = parse_app_instance("app-guid:2").unwrap();
        assert_eq!(parsed.app_id, "app-guid");
        assert_eq!(parsed.index, "2");
    }

    #[test]
    fn test_parse_app_instance_invalid_shapes() {
        assert!(parse_app_instance("app-guid").is_none());
        assert!(parse_app_instance("app-guid:").is_none());
        assert!(parse_app_instance(":1").is_none());
        assert!(parse_app_instance("app-guid:1:extra").is_none());
        assert!(parse_app_instance("").is_none());
    }

    #[test]
    fn test_parse_process_instance_valid() {
        let bare = parse_process_instance("proc-guid").unwrap();
        assert_eq!(bare.process_id, "proc-guid");
        assert_eq!(bare.index, None);

        let indexed = parse_process_instance("proc-guid:0").unwrap();
        assert_eq!(indexed.index.as_deref(), Some("0"));
    }

    #[test]
    fn test_parse_process_instance_invalid_shapes() {
        assert!(parse_process_instance("proc-guid:").is_none());
        assert!(parse_process_instance(":0").is_none());
        assert!(parse_process_instance("proc-guid:0:extra").is_none());
        assert!(parse_process_instance("").is_none());
    }

    // ========== Host validation ==========

    #[test]
    fn test_empty_host_rejected() {
        let handler = LookupHandler::new(registry(), false);
        let response = reject(handler.lookup("", "/", Some("1.2.3.4"), None, None));
        assert_eq!(response.status, 400);
        assert_eq!(response.router_error, "empty_host");
        assert_eq!(response.cache_control, "public,max-age=2");
        assert!(response.body.contains("Request had empty Host header"));
    }

    #[test]
    fn test_host_equal_to_client_ip_rejected() {
        let handler = LookupHandler::new(registry(), false);
        let response = reject(handler.lookup("1.2.3.4", "/", Some("1.2.3.4"), None, None));
        assert_eq!(response.status, 400);
        assert_eq!(response.router_error, "empty_host");
    }

    // ========== Unknown routes ==========

    #[test]
    fn test_unknown_route_404() {
        let handler = LookupHandler::new(registry(), false);
        let response = reject(handler.lookup("example.com", "/", Some("1.2.3.4"), None, None));
        assert_eq!(response.status, 404);
        assert_eq!(response.router_error, "unknown_route");
        assert_eq!(response.cache_control, "no-cache, no-store");
        assert!(response
            .body
            .contains("Requested route ('example.com') does not exist"));
    }

    #[test]
    fn test_unknown_route_with_app_instance_header() {
        let handler = LookupHandler::new(registry(), false);
        let response = reject(handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            Some("app-guid:1"),
            None,
        ));
        assert_eq!(response.status, 400);
        assert_eq!(response.router_error, "unknown_route");
        assert!(response.body.contains(
            "Requested instance ('1') with guid ('app-guid') does not exist for route ('example.com')"
        ));
    }

    #[test]
    fn test_unknown_route_with_process_instance_header() {
        let handler = LookupHandler::new(registry(), false);
        let with_index = reject(handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            None,
            Some("proc-guid:1"),
        ));
        assert_eq!(with_index.status, 400);
        assert!(with_index.body.contains(
            "Requested instance ('1') with process guid ('proc-guid') does not exist for route ('example.com')"
        ));

        let without_index = reject(handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            None,
            Some("proc-guid"),
        ));
        assert_eq!(without_index.status, 400);
        assert!(without_index.body.contains(
            "Requested instance with process guid ('proc-guid') does not exist for route ('example.com')"
        ));
    }

    // ========== Malformed instance headers ==========

    #[test]
    fn test_malformed_app_instance_header() {
        let reg = registry();
        reg.register(&"example.com".into(), endpoint("10.0.0.1", 8080, "app", "0"));
        let handler = LookupHandler::new(reg, false);

        let response = reject(handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            Some("app:1:extra"),
            None,
        ));
        assert_eq!(response.status, 400);
        assert_eq!(response.router_error, "invalid_cf_app_instance_header");
        assert_eq!(response.cache_control, "no-cache, no-store");
        assert_eq!(
            response.body,
            "400 Bad Request: Invalid X-CF-App-Instance Header\n"
        );
    }

    #[test]
    fn test_malformed_process_instance_header() {
        let reg = registry();
        reg.register(&"example.com".into(), endpoint("10.0.0.1", 8080, "app", "0"));
        let handler = LookupHandler::new(reg, false);

        let response = reject(handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            None,
            Some("proc:"),
        ));
        assert_eq!(response.status, 400);
        assert_eq!(response.router_error, "invalid_cf_process_instance_header");
        assert_eq!(
            response.body,
            "400 Bad Request: Invalid X-CF-Process-Instance Header\n"
        );
    }

    // ========== Instance routing ==========

    #[test]
    fn test_app_instance_found() {
        let reg = registry();
        reg.register(&"example.com".into(), endpoint("10.0.0.1", 8080, "app-x", "0"));
        reg.register(&"example.com".into(), endpoint("10.0.0.2", 8080, "app-x", "1"));
        let handler = LookupHandler::new(reg, false);

        match handler.lookup("example.com", "/", Some("1.2.3.4"), Some("app-x:1"), None) {
            LookupOutcome::Route(pool) => {
                assert_eq!(pool.len(), 1);
                pool.each(|e| assert_eq!(e.canonical_addr(), "10.0.0.2:8080"));
            }
            LookupOutcome::Reject(e) => panic!("unexpected rejection: {e:?}"),
        }
    }

    #[test]
    fn test_app_instance_not_found_404_route_exists() {
        let reg = registry();
        reg.register(&"example.com".into(), endpoint("10.0.0.1", 8080, "app-x", "0"));
        let handler = LookupHandler::new(reg, false);

        let response = reject(handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            Some("app-y:1"),
            None,
        ));
        assert_eq!(response.status, 400);
        assert!(response.body.contains(
            "Requested instance ('1') with guid ('app-y') does not exist for route ('example.com')"
        ));
    }

    #[test]
    fn test_process_header_beats_app_header() {
        let reg = registry();
        let mut proc_endpoint = endpoint("10.0.0.1", 8080, "app-x", "0");
        proc_endpoint.process_id = "proc-1".to_string();
        reg.register(&"example.com".into(), proc_endpoint);
        reg.register(&"example.com".into(), endpoint("10.0.0.2", 8080, "app-x", "1"));
        let handler = LookupHandler::new(reg, false);

        match handler.lookup(
            "example.com",
            "/",
            Some("1.2.3.4"),
            Some("app-x:1"),
            Some("proc-1"),
        ) {
            LookupOutcome::Route(pool) => {
                pool.each(|e| assert_eq!(e.canonical_addr(), "10.0.0.1:8080"));
            }
            LookupOutcome::Reject(e) => panic!("unexpected rejection: {e:?}"),
        }
    }

    // ========== Empty pools ==========

    fn registry_with_empty_pool(empty_503: bool) -> Arc<RouteRegistry> {
        let reg = Arc::new(RouteRegistry::new(RegistryOpts {
            empty_pool_response_code_503: empty_503,
            empty_pool_timeout: std::time::Duration::from_secs(600),
            ..Default::default()
        }));
        let e = endpoint("10.0.0.1", 8080, "app", "0");
        reg.register(&"example.com".into(), e.clone());
        reg.unregister(&"example.com".into(), &e);
        reg
    }

    #[test]
    fn test_empty_pool_503_when_enabled() {
        let handler = LookupHandler::new(registry_with_empty_pool(true), true);
        let response = reject(handler.lookup("example.com", "/", Some("1.2.3.4"), None, None));
        assert_eq!(response.status, 503);
        assert_eq!(response.router_error, "no_endpoints");
        assert_eq!(response.cache_control, "public,max-age=2");
        assert!(response
            .body
            .contains("Requested route ('example.com') has no available endpoints"));
    }

    #[test]
    fn test_empty_pool_404_when_disabled() {
        // Without the 503 policy the registry deletes the empty pool on
        // unregister, and even a surviving empty pool reports as an
        // unknown route.
        let handler = LookupHandler::new(registry_with_empty_pool(false), false);
        let response = reject(handler.lookup("example.com", "/", Some("1.2.3.4"), None, None));
        assert_eq!(response.status, 404);
        assert_eq!(response.router_error, "unknown_route");
    }

    // ========== Connection cap exhaustion ==========

    #[test]
    fn test_all_endpoints_over_cap_503() {
        let reg = registry_with_caps(2);
        for port in [8080, 8081] {
            let e = endpoint("10.0.0.1", port, "app", "0");
            for _ in 0..3 {
                e.stats.increment_connections();
            }
            reg.register(&"example.com".into(), e);
        }
        let handler = LookupHandler::new(reg, false);

        let before = metrics::BACKEND_EXHAUSTED_CONNS.get();
        let response = reject(handler.lookup("example.com", "/", Some("1.2.3.4"), None, None));
        assert_eq!(response.status, 503);
        assert_eq!(response.router_error, "backend_exhausted_conns");
        assert!(metrics::BACKEND_EXHAUSTED_CONNS.get() >= before + 1);
    }

    #[test]
    fn test_lookup_probe_does_not_skew_rotation() {
        let reg = registry();
        reg.register(&"example.com".into(), endpoint("10.0.0.1", 8080, "app", "0"));
        reg.register(&"example.com".into(), endpoint("10.0.0.2", 8080, "app", "1"));
        let handler = LookupHandler::new(reg, false);

        // Admission probes must not consume selections: alternating
        // lookup + pick still serves both backends evenly.
        let mut picks = Vec::new();
        for _ in 0..4 {
            match handler.lookup("example.com", "/", Some("1.2.3.4"), None, None) {
                LookupOutcome::Route(pool) => match pool.next_endpoint() {
                    crate::route::Selection::Available(e) => picks.push(e.canonical_addr()),
                    other => panic!("unexpected selection {other:?}"),
                },
                LookupOutcome::Reject(e) => panic!("unexpected rejection: {e:?}"),
            }
        }
        assert_eq!(
            picks,
            vec![
                "10.0.0.1:8080",
                "10.0.0.2:8080",
                "10.0.0.1:8080",
                "10.0.0.2:8080"
            ]
        );
    }

    #[test]
    fn test_one_endpoint_under_cap_routes() {
        let reg = registry_with_caps(2);
        let busy = endpoint("10.0.0.1", 8080, "app", "0");
        for _ in 0..3 {
            busy.stats.increment_connections();
        }
        reg.register(&"example.com".into(), busy);
        reg.register(&"example.com".into(), endpoint("10.0.0.2", 8080, "app", "1"));
        let handler = LookupHandler::new(reg, false);

        assert!(matches!(
            handler.lookup("example.com", "/", Some("1.2.3.4"), None, None),
            LookupOutcome::Route(_)
        ));
    }

    #[test]
    fn test_bad_request_metric_captured() {
        let handler = LookupHandler::new(registry(), false);
        let before = metrics::BAD_REQUESTS.get();
        let _ = handler.lookup("", "/", Some("1.2.3.4"), None, None);
        assert!(metrics::BAD_REQUESTS.get() >= before + 1);
    }
}
