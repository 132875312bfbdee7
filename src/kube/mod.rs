//! Minimal Kubernetes API machinery: typed objects, the list/get primitives
//! and the reconnecting watch loop.
//!
//! The watch endpoint emits newline-delimited JSON envelopes
//! `{"type": "ADDED"|"MODIFIED"|"DELETED", "object": {...}}`. Events are
//! delivered in receive order into an mpsc channel owned by the reconciler;
//! any transport failure sleeps and reconnects, only shutdown ends the loop.

pub mod client;
pub mod informer;
pub mod ingress;
pub mod secret;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::kube::client::Client;

/// Delay between watch reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Shared object header. Identity is `namespace/name`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: String,
    pub generation: i64,
    pub creation_timestamp: Option<String>,
    pub annotations: HashMap<String, String>,
}

impl Metadata {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A typed cluster object that can flow through list/get/watch.
pub trait KubeObject: DeserializeOwned + Clone + Send + 'static {
    fn metadata(&self) -> &Metadata;

    fn full_name(&self) -> String {
        self.metadata().full_name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

/// One watch-stream envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub object: T,
}

#[derive(Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// One-shot list: GET `path`, decode the `{items: [...]}` envelope.
pub async fn list<T: KubeObject>(client: &dyn Client, path: &str) -> Result<Vec<T>, Error> {
    debug!(path, "list");
    let body = client.get(path).await?;
    let list: ObjectList<T> = serde_json::from_slice(&body)?;
    Ok(list.items)
}

/// One-shot read of a single object.
pub async fn get<T: KubeObject>(client: &dyn Client, path: &str) -> Result<T, Error> {
    debug!(path, "get");
    let body = client.get(path).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Long-running watch on `path`.
///
/// Decoded events are sent on `tx` in receive order. Malformed lines are
/// logged and skipped. Transport errors reconnect after [`RECONNECT_DELAY`],
/// forever; the function returns once `shutdown` fires or the receiver side
/// of `tx` is gone.
pub async fn watch<T: KubeObject>(
    client: Arc<dyn Client>,
    path: &'static str,
    tx: mpsc::Sender<WatchEvent<T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        info!(path, "starting watch");

        let err = tokio::select! {
            res = watch_once(client.as_ref(), path, &tx) => match res {
                Ok(()) => Error::Transport("watch stream ended".to_string()),
                Err(e) => e,
            },
            _ = shutdown.changed() => return,
        };

        if tx.is_closed() {
            return;
        }

        warn!(path, error = %err, "watch interrupted, reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => return,
        }
    }
}

/// A single watch connection: stream the body, split lines, decode, dispatch.
async fn watch_once<T: KubeObject>(
    client: &dyn Client,
    path: &str,
    tx: &mpsc::Sender<WatchEvent<T>>,
) -> Result<(), Error> {
    let mut body = client.stream(path).await?;
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = trim_line(&line);
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<WatchEvent<T>>(line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        // Receiver is gone; the reconciler shut down.
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(path, error = %e, "skipping malformed watch line");
                }
            }
        }
    }

    Ok(())
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\n' || last == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    line
}
