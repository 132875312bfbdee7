//! Control-plane HTTP client.
//!
//! Two variants: the in-cluster client (https, bearer token and CA from the
//! service-account mount) and a plain client pointed at a kubectl proxy.
//! Both are stateless per request; the caller owns the response stream.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::Error;

const SERVICEACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Streaming response body. Each item is one data chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, Error>>;

/// Capability to issue GET requests against the cluster API.
#[async_trait]
pub trait Client: Send + Sync {
    /// One-shot GET returning the full response body.
    async fn get(&self, path: &str) -> Result<Bytes, Error>;

    /// Streaming GET for watch endpoints.
    async fn stream(&self, path: &str) -> Result<ByteStream, Error>;
}

fn transport<E: std::fmt::Display>(e: E) -> Error {
    Error::Transport(e.to_string())
}

async fn collect_body(res: Response<Incoming>) -> Result<Bytes, Error> {
    Ok(res.into_body().collect().await.map_err(transport)?.to_bytes())
}

fn body_stream(res: Response<Incoming>) -> ByteStream {
    BodyStream::new(res.into_body())
        .filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(e) => Some(Err(transport(e))),
            }
        })
        .boxed()
}

fn check_status(res: &Response<Incoming>, path: &str) -> Result<(), Error> {
    if res.status().is_success() {
        Ok(())
    } else {
        Err(Error::Transport(format!("http status {} for {}", res.status(), path)))
    }
}

/// Client using the service-account credentials injected by the orchestrator.
pub struct InClusterClient {
    host: String,
    port: u16,
    token: String,
    tls: TlsConnector,
}

impl InClusterClient {
    /// Build the client from the in-cluster environment. Fails with
    /// [`Error::NotInCluster`] when `KUBERNETES_PORT` is absent.
    pub fn from_env() -> Result<Self, Error> {
        if std::env::var("KUBERNETES_PORT").is_err() {
            return Err(Error::NotInCluster);
        }

        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| Error::NotInCluster)?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT_HTTPS")
            .map_err(|_| Error::NotInCluster)?
            .parse::<u16>()
            .map_err(|e| Error::Transport(format!("invalid service port: {e}")))?;

        let mount = Path::new(SERVICEACCOUNT_MOUNT_PATH);
        let token = std::fs::read_to_string(mount.join("token"))?;
        let ca = std::fs::read(mount.join("ca.crt"))?;

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut &ca[..]) {
            roots
                .add(cert?)
                .map_err(|e| Error::Transport(format!("invalid ca certificate: {e}")))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            host,
            port,
            token: token.trim().to_string(),
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn request(&self, path: &str) -> Result<Response<Incoming>, Error> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(transport)?;

        let server_name = ServerName::try_from(self.host.clone()).map_err(transport)?;
        let stream = self.tls.connect(server_name, stream).await.map_err(transport)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "control plane connection closed");
            }
        });

        let req = Request::get(path)
            .header(HOST, &self.host)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .body(Empty::<Bytes>::new())
            .map_err(transport)?;

        let res = sender.send_request(req).await.map_err(transport)?;
        check_status(&res, path)?;
        Ok(res)
    }
}

#[async_trait]
impl Client for InClusterClient {
    async fn get(&self, path: &str) -> Result<Bytes, Error> {
        collect_body(self.request(path).await?).await
    }

    async fn stream(&self, path: &str) -> Result<ByteStream, Error> {
        Ok(body_stream(self.request(path).await?))
    }
}

/// Plain-transport client for a `kubectl proxy` endpoint. No auth.
pub struct ProxyClient {
    host: String,
    port: u16,
}

impl ProxyClient {
    pub fn new(endpoint: &str) -> Result<Self, Error> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| Error::Transport(format!("invalid proxy url {endpoint}: {e}")))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::Transport(format!("proxy url {endpoint} has no host")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        Ok(Self { host, port })
    }

    async fn request(&self, path: &str) -> Result<Response<Incoming>, Error> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(transport)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "control plane connection closed");
            }
        });

        let req = Request::get(path)
            .header(HOST, format!("{}:{}", self.host, self.port))
            .body(Empty::<Bytes>::new())
            .map_err(transport)?;

        let res = sender.send_request(req).await.map_err(transport)?;
        check_status(&res, path)?;
        Ok(res)
    }
}

#[async_trait]
impl Client for ProxyClient {
    async fn get(&self, path: &str) -> Result<Bytes, Error> {
        collect_body(self.request(path).await?).await
    }

    async fn stream(&self, path: &str) -> Result<ByteStream, Error> {
        Ok(body_stream(self.request(path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_client_parses_endpoint() {
        let client = ProxyClient::new("http://127.0.0.1:8001").unwrap();
        assert_eq!(client.host, "127.0.0.1");
        assert_eq!(client.port, 8001);
    }

    #[test]
    fn test_proxy_client_defaults_port() {
        let client = ProxyClient::new("http://apiserver.local").unwrap();
        assert_eq!(client.port, 80);
    }

    #[test]
    fn test_proxy_client_rejects_garbage() {
        assert!(ProxyClient::new("").is_err());
    }

    #[test]
    fn test_in_cluster_requires_environment() {
        // KUBERNETES_PORT is never set in the test environment.
        match InClusterClient::from_env().err() {
            Some(Error::NotInCluster) => {}
            other => panic!("expected NotInCluster, got {other:?}"),
        }
    }
}
