//! ingressd entry point: flag parsing, logging setup and task orchestration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ingressd::config::{NginxSettings, Settings, DEFAULT_LOG_FORMAT};
use ingressd::controller::Controller;
use ingressd::error::Error;
use ingressd::kube::client::{Client, InClusterClient, ProxyClient};
use ingressd::metrics;
use ingressd::nginx::Nginx;

#[derive(Parser)]
#[command(version, about = "Kubernetes ingress controller supervising an nginx data plane")]
struct Cli {
    /// IngressClass to reconcile; empty reconciles every class.
    #[arg(long = "ingress-class", default_value = "")]
    ingress_class: String,

    /// Base URL of a kubectl proxy; uses the in-cluster client when unset.
    #[arg(long = "kube-proxy")]
    kube_proxy: Option<String>,

    /// Log level filter (overridable via RUST_LOG).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Bind address for /metrics and /healthz.
    #[arg(long = "debug-listen")]
    debug_listen: Option<SocketAddr>,

    /// nginx configuration prefix, passed to the child via -p.
    #[arg(long = "ngx-prefix", default_value = "/etc/nginx")]
    ngx_prefix: PathBuf,

    /// Plain HTTP listen port.
    #[arg(long = "ngx-listen", default_value_t = 3000)]
    ngx_listen: u16,

    /// TLS listen port.
    #[arg(long = "ngx-listen-tls", default_value_t = 3443)]
    ngx_listen_tls: u16,

    /// Enable HTTP/2 on TLS servers.
    #[arg(long = "ngx-http2")]
    ngx_http2: bool,

    /// Worker process count; defaults to auto.
    #[arg(long = "ngx-worker-processes")]
    ngx_worker_processes: Option<u32>,

    #[arg(long = "ngx-worker-connections", default_value_t = 256)]
    ngx_worker_connections: u32,

    #[arg(long = "ngx-user", default_value = "nginx")]
    ngx_user: String,

    #[arg(long = "ngx-log-format", default_value = DEFAULT_LOG_FORMAT)]
    ngx_log_format: String,

    /// Access log sink.
    #[arg(long = "ngx-access-log", default_value = "/dev/stdout")]
    ngx_access_log: String,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            ingress_class: self.ingress_class.clone(),
            kube_proxy: self.kube_proxy.clone(),
            debug_listen: self.debug_listen,
            nginx: NginxSettings {
                prefix: self.ngx_prefix.clone(),
                listen: self.ngx_listen,
                listen_tls: self.ngx_listen_tls,
                http2: self.ngx_http2,
                worker_processes: self.ngx_worker_processes,
                worker_connections: self.ngx_worker_connections,
                user: self.ngx_user.clone(),
                log_format: self.ngx_log_format.clone(),
                access_log: self.ngx_access_log.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = cli.settings();

    let client: Arc<dyn Client> = match &settings.kube_proxy {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "using proxy client");
            Arc::new(ProxyClient::new(endpoint)?)
        }
        None => Arc::new(InClusterClient::from_env()?),
    };

    let nginx = Nginx::new(settings.nginx.clone());
    nginx.build_main_config()?;

    let mut controller = Controller::new(client, settings.ingress_class.clone(), nginx);
    controller.bootstrap().await?;

    let proxy = controller.proxy_handle();
    let process = controller.spawn_proxy()?;
    let proxy_enabled = process.enabled();

    info!(pid = std::process::id(), "controller started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = settings.debug_listen {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, rx).await {
                warn!(error = %e, "debug listener failed");
            }
        });
    }

    let reconciler = tokio::spawn(controller.run(shutdown_rx.clone()));
    let mut proxy_task = tokio::spawn(process.wait());

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        res = &mut proxy_task => {
            // The child going away while we are still live is fatal.
            return match res {
                Ok(Ok(status)) => {
                    error!(%status, "nginx exited unexpectedly");
                    Err(Error::ChildExit(status).into())
                }
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    proxy.quit();

    if proxy_enabled {
        match proxy_task.await {
            Ok(Ok(status)) => info!(%status, "nginx stopped"),
            Ok(Err(e)) => warn!(error = %e, "waiting for nginx"),
            Err(e) => warn!(error = %e, "nginx wait task failed"),
        }
    } else {
        proxy_task.abort();
    }

    let _ = reconciler.await;
    Ok(())
}
