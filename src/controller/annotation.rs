//! Recognised ingress annotations.

use crate::kube::Metadata;

pub const PREFIX: &str = "nginx.ingress.kubernetes.io/";

pub const AUTH_SECRET: &str = "nginx.ingress.kubernetes.io/auth-secret";
pub const AUTH_SECRET_NAMESPACE: &str = "nginx.ingress.kubernetes.io/auth-secret-namespace";
pub const ENABLE_ACCESS_LOG: &str = "nginx.ingress.kubernetes.io/enable-access-log";
pub const FORCE_SSL_REDIRECT: &str = "nginx.ingress.kubernetes.io/force-ssl-redirect";
pub const USE_REGEX: &str = "nginx.ingress.kubernetes.io/use-regex";
pub const REWRITE_TARGET: &str = "nginx.ingress.kubernetes.io/rewrite-target";
pub const PROXY_READ_TIMEOUT: &str = "nginx.ingress.kubernetes.io/proxy-read-timeout";
pub const PROXY_CONNECT_TIMEOUT: &str = "nginx.ingress.kubernetes.io/proxy-connect-timeout";
pub const PROXY_SEND_TIMEOUT: &str = "nginx.ingress.kubernetes.io/proxy-send-timeout";

pub fn value<'a>(md: &'a Metadata, key: &str) -> Option<&'a str> {
    md.annotation(key).filter(|v| !v.is_empty())
}

pub fn is_true(md: &Metadata, key: &str) -> bool {
    md.annotation(key) == Some("true")
}

pub fn is_false(md: &Metadata, key: &str) -> bool {
    md.annotation(key) == Some("false")
}

/// Parse a positive integer annotation; zero, negative and unparsable
/// values are ignored.
pub fn positive_int(md: &Metadata, key: &str) -> Option<u64> {
    md.annotation(key)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(key: &str, value: &str) -> Metadata {
        let mut md = Metadata::default();
        md.annotations.insert(key.to_string(), value.to_string());
        md
    }

    #[test]
    fn test_value_ignores_empty() {
        assert_eq!(value(&metadata(AUTH_SECRET, "s1"), AUTH_SECRET), Some("s1"));
        assert_eq!(value(&metadata(AUTH_SECRET, ""), AUTH_SECRET), None);
        assert_eq!(value(&Metadata::default(), AUTH_SECRET), None);
    }

    #[test]
    fn test_boolean_annotations_are_literal() {
        assert!(is_true(&metadata(FORCE_SSL_REDIRECT, "true"), FORCE_SSL_REDIRECT));
        assert!(!is_true(&metadata(FORCE_SSL_REDIRECT, "True"), FORCE_SSL_REDIRECT));
        assert!(is_false(&metadata(ENABLE_ACCESS_LOG, "false"), ENABLE_ACCESS_LOG));
        assert!(!is_false(&Metadata::default(), ENABLE_ACCESS_LOG));
    }

    #[test]
    fn test_positive_int_filters_junk() {
        assert_eq!(positive_int(&metadata(PROXY_READ_TIMEOUT, "30"), PROXY_READ_TIMEOUT), Some(30));
        assert_eq!(positive_int(&metadata(PROXY_READ_TIMEOUT, "0"), PROXY_READ_TIMEOUT), None);
        assert_eq!(positive_int(&metadata(PROXY_READ_TIMEOUT, "-5"), PROXY_READ_TIMEOUT), None);
        assert_eq!(positive_int(&metadata(PROXY_READ_TIMEOUT, "soon"), PROXY_READ_TIMEOUT), None);
    }
}
