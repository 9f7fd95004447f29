//! Forwarding-header mutations applied to outbound requests and
//! response-side rewrites.

use std::time::{SystemTime, UNIX_EPOCH};

use pingora_http::{RequestHeader, ResponseHeader};

use crate::config::ForwardedClientCert;
use crate::errors::RouterError;
use crate::route::Endpoint;

pub const VCAP_REQUEST_ID: &str = "X-Vcap-Request-Id";
pub const CF_INSTANCE_ID: &str = "X-CF-InstanceID";
pub const FORWARDED_CLIENT_CERT: &str = "X-Forwarded-Client-Cert";
pub const VCAP_TRACE: &str = "X-Vcap-Trace";
pub const ROUTER_ERROR: &str = "X-Cf-RouterError";

type Result<T> = std::result::Result<T, Box<pingora_core::Error>>;

fn http_err(e: impl std::fmt::Display) -> Box<pingora_core::Error> {
    RouterError::Http(e.to_string()).into_pg()
}

/// Appends the immediate client ip to `X-Forwarded-For`.
pub fn append_forwarded_for(req: &mut RequestHeader, client_ip: &str) -> Result<()> {
    let value = match req
        .headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip.to_string(),
    };
    req.insert_header("X-Forwarded-For", value).map_err(http_err)
}

/// Sets `X-Forwarded-Proto` from the ingress scheme iff absent.
pub fn set_forwarded_proto(req: &mut RequestHeader, scheme: &str) -> Result<()> {
    if req.headers.get("X-Forwarded-Proto").is_none() {
        req.insert_header("X-Forwarded-Proto", scheme).map_err(http_err)?;
    }
    Ok(())
}

/// Appends `X-Request-Start` (unix millis) iff no entry exists at all. An
/// existing empty value counts as present.
pub fn append_request_start(req: &mut RequestHeader) -> Result<()> {
    if req.headers.get("X-Request-Start").is_none() {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        req.append_header("X-Request-Start", millis.to_string())
            .map_err(http_err)?;
    }
    Ok(())
}

/// Places the request id on the outbound request, replacing any inbound
/// value.
pub fn set_vcap_request_id(req: &mut RequestHeader, request_id: &str) -> Result<()> {
    req.insert_header(VCAP_REQUEST_ID, request_id).map_err(http_err)
}

/// `X-CF-InstanceID`: the endpoint's private instance id, or `host:port`.
pub fn set_instance_id(req: &mut RequestHeader, endpoint: &Endpoint) -> Result<()> {
    req.insert_header(CF_INSTANCE_ID, endpoint.instance_header_value())
        .map_err(http_err)
}

/// Applies the configured `X-Forwarded-Client-Cert` policy.
///
/// `client_cert` carries the gateway-derived value for a mutually
/// authenticated ingress connection, when one exists.
pub fn apply_forwarded_client_cert(
    req: &mut RequestHeader,
    policy: ForwardedClientCert,
    client_cert: Option<&str>,
) -> Result<()> {
    match policy {
        ForwardedClientCert::AlwaysForward => {}
        ForwardedClientCert::Forward => {
            if client_cert.is_none() {
                req.remove_header(FORWARDED_CLIENT_CERT);
            }
        }
        ForwardedClientCert::SanitizeSet => {
            req.remove_header(FORWARDED_CLIENT_CERT);
            if let Some(cert) = client_cert {
                req.insert_header(FORWARDED_CLIENT_CERT, cert).map_err(http_err)?;
            }
        }
    }
    Ok(())
}

/// Forces `Connection: close` on the outbound request; used when
/// keep-alive is disabled for `Expect: 100-continue` requests.
pub fn force_connection_close(req: &mut RequestHeader) -> Result<()> {
    req.insert_header("Connection", "close").map_err(http_err)
}

/// Compression is disabled: the proxy never requests encodings, so the
/// backend always answers with an identity body.
pub fn strip_accept_encoding(req: &mut RequestHeader) {
    req.remove_header("Accept-Encoding");
}

/// Ensures the response carries the request id without clobbering one the
/// backend already set.
pub fn ensure_response_request_id(resp: &mut ResponseHeader, request_id: &str) -> Result<()> {
    if resp.headers.get(VCAP_REQUEST_ID).is_none() {
        resp.insert_header(VCAP_REQUEST_ID, request_id).map_err(http_err)?;
    }
    Ok(())
}

/// Trace headers revealed when the client presented the configured trace
/// key.
pub fn set_trace_headers(
    resp: &mut ResponseHeader,
    backend_addr: &str,
    router_ip: &str,
) -> Result<()> {
    resp.insert_header("X-Vcap-Backend", backend_addr).map_err(http_err)?;
    resp.insert_header("X-Cf-RouteEndpoint", backend_addr)
        .map_err(http_err)?;
    resp.insert_header("X-Vcap-Router", router_ip).map_err(http_err)
}

/// Configurable response rewrites, applied uniformly to proxied and
/// locally-generated responses.
pub fn apply_response_rewrites(
    resp: &mut ResponseHeader,
    add_if_not_present: &[(String, String)],
    remove: &[String],
) -> Result<()> {
    for (name, value) in add_if_not_present {
        if resp.headers.get(name.as_str()).is_none() {
            resp.insert_header(name.clone(), value.as_str()).map_err(http_err)?;
        }
    }
    for name in remove {
        resp.remove_header(name.as_str());
    }
    Ok(())
}

/// Websocket detection: an `Upgrade` token anywhere in the `Connection`
/// header list, case-insensitive.
pub fn is_upgrade_request(req: &RequestHeader) -> bool {
    req.headers
        .get_all("Connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}
