//! HTTP health server for platform load-balancer probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints,
//! plus `/routes` with a JSON snapshot of the registry. Readiness degrades
//! as soon as the router starts draining so the upstream balancer stops
//! sending traffic before the listener goes away.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::drain::DrainController;
use crate::registry::RouteRegistry;

/// Handles health check requests.
///
/// Returns 200 "ok" for `/healthz` and `/readyz` while serving, 503 once
/// draining. Returns 404 for all other paths.
pub async fn health_handler(
    req: Request<hyper::body::Incoming>,
    drain: Arc<DrainController>,
    registry: Arc<RouteRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/readyz" => {
            if drain.is_draining() {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .header("Cache-Control", "private, max-age=0")
                    .header("Expires", "0")
                    .body(Full::new(Bytes::from("draining")))
                    .expect("response")
            } else {
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Cache-Control", "private, max-age=0")
                    .header("Expires", "0")
                    .body(Full::new(Bytes::from("ok\n")))
                    .expect("response")
            }
        }
        "/routes" => {
            let snapshot = registry.snapshot().to_string();
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(snapshot)))
                .expect("response")
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .expect("response"),
    };
    Ok(response)
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(
    addr: SocketAddr,
    drain: Arc<DrainController>,
    registry: Arc<RouteRegistry>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let drain = Arc::clone(&drain);
        let registry = Arc::clone(&registry);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                health_handler(req, Arc::clone(&drain), Arc::clone(&registry))
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOpts;
    use crate::route::{Endpoint, EndpointOpts};
    use std::net::TcpListener as StdTcpListener;

    fn spawn_server(
        drain: Arc<DrainController>,
        registry: Arc<RouteRegistry>,
    ) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = tokio::spawn(async move {
            let _ = start_health_server(addr, drain, registry).await;
        });
        (addr, handle)
    }

    /// Simple HTTP GET using tokio's TcpStream (no external deps).
    async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status_line = response.lines().next().unwrap();
        let status_code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
        (status_code, body)
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let drain = DrainController::new();
        let registry = Arc::new(RouteRegistry::new(RegistryOpts::default()));
        let (addr, handle) = spawn_server(drain, registry);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, body) = http_get(addr, "/healthz").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok\n");

        handle.abort();
    }

    #[tokio::test]
    async fn test_readyz_degrades_while_draining() {
        let drain = DrainController::new();
        let registry = Arc::new(RouteRegistry::new(RegistryOpts::default()));
        let (addr, handle) = spawn_server(Arc::clone(&drain), registry);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        drain.begin_drain();
        let (status, _) = http_get(addr, "/readyz").await;
        assert_eq!(status, 503);

        handle.abort();
    }

    #[tokio::test]
    async fn test_routes_snapshot() {
        let drain = DrainController::new();
        let registry = Arc::new(RouteRegistry::new(RegistryOpts::default()));
        registry.register(
            &"example.com".into(),
            Endpoint::new(EndpointOpts {
                host: "10.0.0.1".to_string(),
                port: 8080,
                ..Default::default()
            }),
        );
        let (addr, handle) = spawn_server(drain, Arc::clone(&registry));
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, body) = http_get(addr, "/routes").await;
        assert_eq!(status, 200);
        assert!(body.contains("example.com"));

        handle.abort();
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let drain = DrainController::new();
        let registry = Arc::new(RouteRegistry::new(RegistryOpts::default()));
        let (addr, handle) = spawn_server(drain, registry);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, _) = http_get(addr, "/foo").await;
        assert_eq!(status, 404);

        handle.abort();
    }
}
