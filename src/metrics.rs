//! Controller metrics and the debug listener.
//!
//! Counters are registered against a crate-local registry and exposed
//! together with a health endpoint when `--debug-listen` is set.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::kube::EventType;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    static ref WATCH_EVENTS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new("ingressd_watch_events_total", "Watch events received by resource and type"),
            &["resource", "type"],
        )
        .unwrap_or_else(|e| {
            eprintln!("WARN: Failed to create watch events counter: {}", e);
            IntCounterVec::new(Opts::new("dummy", "dummy"), &["resource", "type"]).unwrap()
        });
        if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register watch events counter: {}", e);
            eprintln!("WARN: Metrics collection will be degraded but the controller will continue");
        }
        counter
    };

    static ref RELOADS_TOTAL: IntCounter = {
        let counter = IntCounter::new("ingressd_nginx_reloads_total", "Reload signals sent to nginx")
            .unwrap_or_else(|e| {
                eprintln!("WARN: Failed to create reloads counter: {}", e);
                IntCounter::new("dummy", "dummy").unwrap()
            });
        if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register reloads counter: {}", e);
            eprintln!("WARN: Metrics collection will be degraded but the controller will continue");
        }
        counter
    };

    static ref RECONCILE_ERRORS_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new("ingressd_reconcile_errors_total", "Reconcile errors by reason"),
            &["reason"],
        )
        .unwrap_or_else(|e| {
            eprintln!("WARN: Failed to create reconcile errors counter: {}", e);
            IntCounterVec::new(Opts::new("dummy", "dummy"), &["reason"]).unwrap()
        });
        if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
            eprintln!("WARN: Failed to register reconcile errors counter: {}", e);
            eprintln!("WARN: Metrics collection will be degraded but the controller will continue");
        }
        counter
    };
}

pub fn watch_event(resource: &str, event_type: EventType) {
    WATCH_EVENTS_TOTAL
        .with_label_values(&[resource, event_type.as_str()])
        .inc();
}

pub fn reload() {
    RELOADS_TOTAL.inc();
}

pub fn reconcile_error(reason: &str) {
    RECONCILE_ERRORS_TOTAL.with_label_values(&[reason]).inc();
}

/// Serve /metrics and /healthz until `shutdown` fires.
pub async fn serve(addr: SocketAddr, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "debug listener started");

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => return Ok(()),
        };

        tokio::spawn(async move {
            let result = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(handle))
                .await;
            if let Err(e) = result {
                debug!(error = %e, "debug connection closed");
            }
        });
    }
}

async fn handle(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buf = Vec::new();
            let encoder = TextEncoder::new();
            if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
                warn!(error = %e, "encode metrics");
            }
            Response::builder()
                .header("Content-Type", encoder.format_type())
                .body(Full::new(Bytes::from(buf)))
        }
        "/healthz" => Response::builder().body(Full::new(Bytes::from_static(b"ok\n"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };

    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
