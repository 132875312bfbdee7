//! Controller configuration.
//!
//! Everything is resolved once in `main` and handed to the components at
//! construction; no process-wide mutable state.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Default nginx access-log format, matching the combined format with
/// forwarded-for appended.
pub const DEFAULT_LOG_FORMAT: &str = r#"'$remote_addr - $remote_user [$time_local] "$request" '
'$status $body_bytes_sent "$http_referer" '
'"$http_user_agent" "$http_x_forwarded_for"'"#;

/// Top-level settings for the controller.
#[derive(Debug, Clone)]
pub struct Settings {
    /// IngressClass to reconcile; empty means all classes.
    pub ingress_class: String,

    /// Base URL of a kubectl proxy to use instead of the in-cluster client.
    pub kube_proxy: Option<String>,

    /// Bind address for the /metrics and /healthz debug listener.
    pub debug_listen: Option<SocketAddr>,

    pub nginx: NginxSettings,
}

/// Settings for the supervised nginx child.
#[derive(Debug, Clone)]
pub struct NginxSettings {
    /// Configuration prefix handed to nginx via `-p`. All generated files
    /// (nginx.conf, http.conf, authfiles/, tls/) live under it.
    pub prefix: PathBuf,

    /// Plain HTTP listen port.
    pub listen: u16,

    /// TLS listen port.
    pub listen_tls: u16,

    /// Enable HTTP/2 on TLS servers.
    pub http2: bool,

    /// Worker process count; `None` renders `auto`.
    pub worker_processes: Option<u32>,

    pub worker_connections: u32,

    pub user: String,

    pub log_format: String,

    /// Access log sink, e.g. `/dev/stdout`.
    pub access_log: String,
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("/etc/nginx"),
            listen: 3000,
            listen_tls: 3443,
            http2: false,
            worker_processes: None,
            worker_connections: 256,
            user: "nginx".to_string(),
            log_format: DEFAULT_LOG_FORMAT.to_string(),
            access_log: "/dev/stdout".to_string(),
        }
    }
}
