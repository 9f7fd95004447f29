//! Prometheus metrics and the text exposition endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;

pub static BAD_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("bad_requests", "Requests rejected before lookup or proxying")
        .expect("counter")
});

pub static BACKEND_EXHAUSTED_CONNS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "backend_exhausted_conns",
        "Requests rejected because every endpoint of the pool was at its connection cap"
    )
    .expect("counter")
});

pub static ROUTES_PRUNED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("routes_pruned", "Endpoints removed by the stale-route pruner")
        .expect("counter")
});

pub static ENDPOINT_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "endpoint_failures",
        "Requests that exhausted every endpoint without a successful dial"
    )
    .expect("counter")
});

pub static WEBSOCKET_UPGRADES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("websocket_upgrades", "Completed websocket upgrades").expect("counter")
});

pub static REGISTRY_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "registry_messages",
        "Processed registration frames by outcome",
        &["action"]
    )
    .expect("counter")
});

pub static TOTAL_ROUTES: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("total_routes", "Route keys in the registry").expect("gauge"));

pub static MS_SINCE_LAST_UPDATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "ms_since_last_update",
        "Milliseconds since the registry last changed, -1 before the first update"
    )
    .expect("gauge")
});

pub static ROUTE_LOOKUP_TIME: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "route_lookup_time",
        "Registry lookup latency in seconds",
        prometheus::exponential_buckets(1e-6, 4.0, 10).expect("buckets")
    )
    .expect("histogram")
});

async fn handle_metrics(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(404)
            .body(Full::new(Bytes::new()))
            .expect("response"));
    }
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode");
    let response = Response::builder()
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .expect("response");
    Ok(response)
}

/// Serves `/metrics` in prometheus text format on the given address.
pub async fn serve_metrics(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_once() {
        // Touching each Lazy twice must not panic on double registration.
        BAD_REQUESTS.inc();
        let v = BAD_REQUESTS.get();
        BAD_REQUESTS.inc();
        assert!(BAD_REQUESTS.get() >= v + 1);
    }

    #[test]
    fn test_registry_message_labels() {
        REGISTRY_MESSAGES.with_label_values(&["ADDED"]).inc();
        assert!(REGISTRY_MESSAGES.with_label_values(&["ADDED"]).get() >= 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = tokio::spawn(async move {
            let _ = serve_metrics(addr).await;
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        BAD_REQUESTS.inc();
        stream
            .write_all(
                format!("GET /metrics HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("bad_requests"));

        handle.abort();
    }
}
