//! Ingress object model and request paths.

use serde::Deserialize;

use super::{KubeObject, Metadata};

pub const LIST_PATH: &str = "/apis/networking.k8s.io/v1/ingresses";
pub const WATCH_PATH: &str = "/apis/networking.k8s.io/v1/watch/ingresses";

/// Class annotation checked by the event filter.
pub const CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Ingress {
    pub metadata: Metadata,
    pub spec: IngressSpec,
}

impl KubeObject for Ingress {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngressSpec {
    pub rules: Vec<Rule>,
    pub tls: Vec<IngressTls>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub host: String,
    pub http: HttpRule,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpRule {
    pub paths: Vec<HttpPath>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpPath {
    pub path: String,
    pub path_type: PathType,
    pub backend: Backend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum PathType {
    #[default]
    Prefix,
    Exact,
    ImplementationSpecific,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Backend {
    pub service: ServiceBackend,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceBackend {
    pub name: String,
    pub port: ServicePort,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServicePort {
    pub number: u16,
}

/// TLS entry pairing a secret with the hosts that use it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngressTls {
    pub secret_name: String,
    pub hosts: Vec<String>,
}

/// Event filter: an ingress is in scope when the configured class is empty
/// or its class annotation matches it exactly.
pub fn matches_class(is: &Ingress, class: &str) -> bool {
    if class.is_empty() {
        return true;
    }
    is.metadata.annotation(CLASS_ANNOTATION) == Some(class)
}
