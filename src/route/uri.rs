//! Route uris and lookup-key normalization.
//!
//! A route uri is the `host[/context/path]` string carried by registration
//! frames and reconstructed from incoming requests. Lookup keys are
//! case-normalized on the host, query-stripped, and free of a trailing
//! slash, so that `Foo.Example.COM/bar?q=1` and `foo.example.com/bar`
//! address the same pool.

use std::fmt;

/// A `host[/path]` route uri.
///
/// Wraps the raw string; [`RouteUri::route_key`] produces the canonical
/// form used to index the registry trie.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteUri(String);

/// Returned by [`RouteUri::next_wildcard`] when the host has no further
/// label to generalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WildcardExhausted;

impl RouteUri {
    pub fn new(raw: impl Into<String>) -> Self {
        RouteUri(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical lookup key: scheme prefix removed, query stripped,
    /// trailing slash dropped, host lowercased. The path keeps its case.
    pub fn route_key(&self) -> RouteUri {
        let mut uri = self.0.as_str();
        for prefix in ["http://", "https://"] {
            uri = uri.strip_prefix(prefix).unwrap_or(uri);
        }
        let uri = match uri.find('?') {
            Some(idx) => &uri[..idx],
            None => uri,
        };
        let uri = uri.strip_suffix('/').unwrap_or(uri);

        let key = match uri.find('/') {
            Some(idx) => format!("{}{}", uri[..idx].to_lowercase(), &uri[idx..]),
            None => uri.to_lowercase(),
        };
        RouteUri(key)
    }

    /// The next coarser wildcard key: the leftmost host label is dropped
    /// and `*.` prepended. `foo.bar.example.com` steps to
    /// `*.bar.example.com`, then `*.example.com`, then `*.com`, then the
    /// sequence is exhausted. The context path is carried through.
    pub fn next_wildcard(&self) -> Result<RouteUri, WildcardExhausted> {
        let uri = self.0.strip_suffix('/').unwrap_or(&self.0);
        let (host, path) = match uri.find('/') {
            Some(idx) => (&uri[..idx], &uri[idx..]),
            None => (uri, ""),
        };
        let host = host.strip_prefix("*.").unwrap_or(host);
        match host.split_once('.') {
            Some((_, rest)) if !rest.is_empty() => Ok(RouteUri(format!("*.{rest}{path}"))),
            _ => Err(WildcardExhausted),
        }
    }

    /// Splits into `(host, context_path)`. The context path always starts
    /// with `/`; a bare host yields `/`. Any query is stripped.
    pub fn split_host_and_context_path(&self) -> (String, String) {
        let trimmed = self.0.strip_prefix('/').unwrap_or(&self.0);
        let (host, context_path) = match trimmed.split_once('/') {
            Some((host, rest)) => (host, format!("/{rest}")),
            None => (trimmed, "/".to_string()),
        };
        let context_path = match context_path.find('?') {
            Some(idx) => context_path[..idx].to_string(),
            None => context_path,
        };
        (host.to_string(), context_path)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RouteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteUri {
    fn from(raw: &str) -> Self {
        RouteUri::new(raw)
    }
}

impl From<String> for RouteUri {
    fn from(raw: String) -> Self {
        RouteUri(raw)
    }
}
