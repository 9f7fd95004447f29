//! Access record assembly.
//!
//! One record per proxied (or locally answered) request, rendered as the
//! platform's `key:value` access line and emitted through `tracing` under
//! `target = "access"`. Stages a request never reached render as `-`.

use std::time::Duration;

use tracing::info;

/// Status recorded when the client went away before a response could be
/// written. Never sent on the wire.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Default, Clone)]
pub struct AccessRecord {
    pub host: String,
    pub method: String,
    pub path: String,
    pub http_version: String,
    pub status: Option<u16>,
    pub bytes_received: usize,
    pub bytes_sent: usize,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub backend_addr: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub x_forwarded_proto: Option<String>,
    pub vcap_request_id: Option<String>,
    pub app_id: Option<String>,
    pub app_index: Option<String>,
    pub instance_id: Option<String>,

    pub response_time: Option<Duration>,
    pub gorouter_time: Option<Duration>,
    pub backend_time: Option<Duration>,
    pub dns_time: Option<Duration>,
    pub dial_time: Option<Duration>,
    pub tls_time: Option<Duration>,
    pub failed_attempts: u32,
    pub failed_attempts_time: Option<Duration>,
}

fn quoted(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => format!("\"{v}\""),
        _ => "\"-\"".to_string(),
    }
}

fn seconds(value: Option<Duration>) -> String {
    match value {
        Some(d) => format!("{:.6}", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

impl AccessRecord {
    /// Renders the full access line.
    pub fn line(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut line = format!(
            "{} - \"{} {} {}\" {} {} {} {} {} {} {}",
            if self.host.is_empty() { "-" } else { &self.host },
            self.method,
            self.path,
            self.http_version,
            status,
            self.bytes_received,
            self.bytes_sent,
            quoted(self.referer.as_deref()),
            quoted(self.user_agent.as_deref()),
            quoted(self.remote_addr.as_deref()),
            quoted(self.backend_addr.as_deref()),
        );
        line.push_str(&format!(
            " x_forwarded_for:{} x_forwarded_proto:{} vcap_request_id:{}",
            quoted(self.x_forwarded_for.as_deref()),
            quoted(self.x_forwarded_proto.as_deref()),
            quoted(self.vcap_request_id.as_deref()),
        ));
        line.push_str(&format!(
            " response_time:{} gorouter_time:{}",
            seconds(self.response_time),
            seconds(self.gorouter_time),
        ));
        line.push_str(&format!(
            " app_id:{} app_index:{} instance_id:{}",
            quoted(self.app_id.as_deref()),
            quoted(self.app_index.as_deref()),
            quoted(self.instance_id.as_deref()),
        ));
        line.push_str(&format!(
            " failed_attempts:{} failed_attempts_time:{} dns_time:{} dial_time:{} tls_time:{} backend_time:{}",
            self.failed_attempts,
            seconds(self.failed_attempts_time),
            seconds(self.dns_time),
            seconds(self.dial_time),
            seconds(self.tls_time),
            seconds(self.backend_time),
        ));
        line
    }

    pub fn emit(&self) {
        info!(target: "access", "{}", self.line());
    }

    /// `gorouter_time` is the portion of the response time spent inside
    /// the router itself, i.e. everything that is not the backend.
    pub fn finish(&mut self, response_time: Duration) {
        self.response_time = Some(response_time);
        let spent_on_backend = self.backend_time.unwrap_or_default()
            + self.failed_attempts_time.unwrap_or_default();
        self.gorouter_time = Some(response_time.saturating_sub(spent_on_backend));
    }
}
