//! Secret object model and request paths.
//!
//! Secret data values travel base64-encoded on the wire and are decoded at
//! materialisation time.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use super::{KubeObject, Metadata};
use crate::error::Error;

pub const WATCH_PATH: &str = "/api/v1/watch/secrets";

pub fn read_path(namespace: &str, name: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/secrets/{name}")
}

/// Key expected in Opaque auth secrets (htpasswd contents).
pub const AUTH_KEY: &str = "auth";
/// Keys expected in TLS secrets.
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum SecretType {
    #[default]
    Opaque,
    #[serde(rename = "kubernetes.io/tls")]
    Tls,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Secret {
    pub metadata: Metadata,
    pub data: HashMap<String, String>,
    #[serde(rename = "type")]
    pub secret_type: SecretType,
}

impl KubeObject for Secret {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Secret {
    /// Decode the named data key. Fails with [`Error::MissingSecretKey`]
    /// when the key is absent.
    pub fn decode_key(&self, key: &'static str) -> Result<Vec<u8>, Error> {
        let value = self.data.get(key).ok_or(Error::MissingSecretKey(key))?;
        Ok(STANDARD.decode(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tls_secret() {
        let body = r#"{
            "metadata": {"name": "cert", "namespace": "prod"},
            "type": "kubernetes.io/tls",
            "data": {"tls.crt": "Q1JU", "tls.key": "S0VZ"}
        }"#;
        let sec: Secret = serde_json::from_str(body).unwrap();
        assert_eq!(sec.secret_type, SecretType::Tls);
        assert_eq!(sec.decode_key(TLS_CERT_KEY).unwrap(), b"CRT");
        assert_eq!(sec.decode_key(TLS_KEY_KEY).unwrap(), b"KEY");
    }

    #[test]
    fn test_unknown_type_maps_to_other() {
        let sec: Secret =
            serde_json::from_str(r#"{"type": "kubernetes.io/dockerconfigjson"}"#).unwrap();
        assert_eq!(sec.secret_type, SecretType::Other);
    }

    #[test]
    fn test_missing_type_defaults_to_opaque() {
        let sec: Secret = serde_json::from_str(r#"{"metadata": {"name": "s"}}"#).unwrap();
        assert_eq!(sec.secret_type, SecretType::Opaque);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let sec = Secret::default();
        match sec.decode_key(AUTH_KEY) {
            Err(Error::MissingSecretKey(key)) => assert_eq!(key, "auth"),
            other => panic!("expected MissingSecretKey, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_base64_is_reported() {
        let mut sec = Secret::default();
        sec.data.insert(AUTH_KEY.to_string(), "not base64!".to_string());
        assert!(matches!(sec.decode_key(AUTH_KEY), Err(Error::SecretEncoding(_))));
    }

    #[test]
    fn test_read_path() {
        assert_eq!(read_path("a", "s1"), "/api/v1/namespaces/a/secrets/s1");
    }
}
