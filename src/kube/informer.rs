//! Reference-counted object cache fed by `get` and a watch stream.
//!
//! Only [`Informer::get`] creates references; objects discovered via watch
//! alone are never cached. The owner applies watch events through
//! [`Informer::apply`] and reacts to the returned object, so every cache
//! mutation stays on the single reconciler task.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::client::Client;
use super::KubeObject;
use crate::error::Error;

struct Ref<T> {
    ref_count: usize,
    object: T,
}

pub struct Informer<T: KubeObject> {
    client: Arc<dyn Client>,
    read_path: fn(&str, &str) -> String,
    refs: HashMap<String, Ref<T>>,
}

impl<T: KubeObject> Informer<T> {
    pub fn new(client: Arc<dyn Client>, read_path: fn(&str, &str) -> String) -> Self {
        Self {
            client,
            read_path,
            refs: HashMap::new(),
        }
    }

    /// Fetch-or-reference: a cached entry gains a reference and is returned
    /// as-is; otherwise the object is read from the control plane and cached
    /// with a single reference.
    pub async fn get(&mut self, namespace: &str, name: &str) -> Result<T, Error> {
        let full_name = format!("{namespace}/{name}");

        if let Some(entry) = self.refs.get_mut(&full_name) {
            entry.ref_count += 1;
            debug!(object = %full_name, refs = entry.ref_count, "informer ref");
            return Ok(entry.object.clone());
        }

        let object: T = super::get(self.client.as_ref(), &(self.read_path)(namespace, name)).await?;
        debug!(object = %full_name, refs = 1, "informer ref");
        self.refs.insert(
            full_name,
            Ref {
                ref_count: 1,
                object: object.clone(),
            },
        );
        Ok(object)
    }

    /// Drop one reference. Returns the cached object when the last reference
    /// goes away, so the owner can run its release cleanup.
    pub fn release(&mut self, namespace: &str, name: &str) -> Option<T> {
        let full_name = format!("{namespace}/{name}");

        let last = match self.refs.get_mut(&full_name) {
            Some(entry) if entry.ref_count > 1 => {
                entry.ref_count -= 1;
                debug!(object = %full_name, refs = entry.ref_count, "informer unref");
                false
            }
            Some(_) => true,
            None => return None,
        };

        if last {
            debug!(object = %full_name, refs = 0, "informer unref");
            self.refs.remove(&full_name).map(|entry| entry.object)
        } else {
            None
        }
    }

    /// Feed one watch event into the cache. A MODIFIED event for a cached
    /// key replaces the stored object in place and returns the new object;
    /// DELETED drops the entry silently; everything else is ignored.
    pub fn apply(&mut self, event: super::WatchEvent<T>) -> Option<T> {
        let full_name = event.object.full_name();
        match event.event_type {
            super::EventType::Modified => {
                if let Some(entry) = self.refs.get_mut(&full_name) {
                    entry.object = event.object.clone();
                    return Some(event.object);
                }
                None
            }
            super::EventType::Deleted => {
                self.refs.remove(&full_name);
                None
            }
            super::EventType::Added => None,
        }
    }

    pub fn ref_count(&self, namespace: &str, name: &str) -> usize {
        self.refs
            .get(&format!("{namespace}/{name}"))
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::client::ByteStream;
    use crate::kube::secret::{read_path, Secret};
    use crate::kube::{EventType, WatchEvent};
    use async_trait::async_trait;
    use hyper::body::Bytes;
    use std::sync::Mutex;

    struct FixedClient {
        bodies: Mutex<HashMap<String, String>>,
        gets: Mutex<usize>,
    }

    impl FixedClient {
        fn with_secret(namespace: &str, name: &str, body: &str) -> Arc<Self> {
            let mut bodies = HashMap::new();
            bodies.insert(read_path(namespace, name), body.to_string());
            Arc::new(Self {
                bodies: Mutex::new(bodies),
                gets: Mutex::new(0),
            })
        }

        fn get_count(&self) -> usize {
            *self.gets.lock().unwrap()
        }
    }

    #[async_trait]
    impl Client for FixedClient {
        async fn get(&self, path: &str) -> Result<Bytes, Error> {
            *self.gets.lock().unwrap() += 1;
            self.bodies
                .lock()
                .unwrap()
                .get(path)
                .map(|body| Bytes::from(body.clone()))
                .ok_or_else(|| Error::Transport(format!("http status 404 for {path}")))
        }

        async fn stream(&self, _path: &str) -> Result<ByteStream, Error> {
            unimplemented!("not used by informer tests")
        }
    }

    fn secret_body(name: &str) -> String {
        format!(r#"{{"metadata":{{"name":"{name}","namespace":"a"}},"data":{{"auth":"dTpwdwo="}}}}"#)
    }

    #[tokio::test]
    async fn test_get_caches_and_counts_references() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client.clone(), read_path);

        informer.get("a", "s1").await.unwrap();
        informer.get("a", "s1").await.unwrap();

        assert_eq!(informer.ref_count("a", "s1"), 2);
        assert_eq!(client.get_count(), 1, "second get must hit the cache");
    }

    #[tokio::test]
    async fn test_release_returns_object_on_last_reference() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client, read_path);

        informer.get("a", "s1").await.unwrap();
        informer.get("a", "s1").await.unwrap();

        assert!(informer.release("a", "s1").is_none());
        assert_eq!(informer.ref_count("a", "s1"), 1);

        let released = informer.release("a", "s1").expect("last release yields the object");
        assert_eq!(released.full_name(), "a/s1");
        assert!(informer.is_empty());
    }

    #[tokio::test]
    async fn test_release_of_unknown_key_is_noop() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client, read_path);
        assert!(informer.release("a", "missing").is_none());
    }

    #[tokio::test]
    async fn test_get_propagates_transport_errors() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client, read_path);
        assert!(informer.get("a", "other").await.is_err());
        assert_eq!(informer.ref_count("a", "other"), 0);
    }

    #[tokio::test]
    async fn test_apply_modified_replaces_cached_object() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client, read_path);
        informer.get("a", "s1").await.unwrap();

        let updated: Secret = serde_json::from_str(
            r#"{"metadata":{"name":"s1","namespace":"a"},"data":{"auth":"bmV3Cg=="}}"#,
        )
        .unwrap();
        let returned = informer.apply(WatchEvent {
            event_type: EventType::Modified,
            object: updated,
        });

        let returned = returned.expect("modified cached secret is surfaced");
        assert_eq!(returned.data["auth"], "bmV3Cg==");
        assert_eq!(informer.ref_count("a", "s1"), 1, "refcount untouched by modify");
    }

    #[tokio::test]
    async fn test_apply_never_creates_references() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client, read_path);

        let discovered: Secret = serde_json::from_str(&secret_body("s2")).unwrap();
        assert!(informer
            .apply(WatchEvent {
                event_type: EventType::Modified,
                object: discovered.clone(),
            })
            .is_none());
        assert!(informer
            .apply(WatchEvent {
                event_type: EventType::Added,
                object: discovered,
            })
            .is_none());
        assert!(informer.is_empty());
    }

    #[tokio::test]
    async fn test_apply_deleted_drops_silently() {
        let client = FixedClient::with_secret("a", "s1", &secret_body("s1"));
        let mut informer: Informer<Secret> = Informer::new(client, read_path);
        informer.get("a", "s1").await.unwrap();

        let deleted: Secret = serde_json::from_str(&secret_body("s1")).unwrap();
        assert!(informer
            .apply(WatchEvent {
                event_type: EventType::Deleted,
                object: deleted,
            })
            .is_none());
        assert_eq!(informer.ref_count("a", "s1"), 0);
    }
}
