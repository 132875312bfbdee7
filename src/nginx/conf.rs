//! In-memory nginx configuration model.
//!
//! Two parallel server tables (plain and TLS-terminating) keyed by host,
//! each server keyed by the canonical string form of its location paths.
//! BTreeMaps keep rendering deterministic.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::Error;
use crate::kube::ingress::PathType;

/// Host of the catch-all server. Always present, owns the built-in
/// diagnostic locations.
pub const CATCH_ALL: &str = "_";

/// A location's path match: textual path, path type and regex flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    pub path: String,
    pub path_type: PathType,
    pub regex: bool,
}

impl Default for PathMatch {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            path_type: PathType::Prefix,
            regex: false,
        }
    }
}

impl PathMatch {
    pub fn prefix(path: &str) -> Self {
        Self {
            path: path.to_string(),
            path_type: PathType::Prefix,
            regex: false,
        }
    }

    pub fn exact(path: &str) -> Self {
        Self {
            path: path.to_string(),
            path_type: PathType::Exact,
            regex: false,
        }
    }

    pub fn regex(path: &str) -> Self {
        Self {
            path: path.to_string(),
            path_type: PathType::ImplementationSpecific,
            regex: true,
        }
    }

    /// Canonical key, doubling as the nginx location selector:
    /// `= <p>` for exact matches, `~* <p>` for regexes, `<p>` otherwise.
    pub fn key(&self) -> String {
        if self.path_type == PathType::Exact {
            format!("= {}", self.path)
        } else if self.regex {
            format!("~* {}", self.path)
        } else {
            self.path.clone()
        }
    }
}

impl fmt::Display for PathMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthConf {
    pub realm: String,
    pub user_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPassConf {
    pub upstream: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnConf {
    pub code: u16,
    pub body: String,
}

/// Free-form directive rendered as `name args;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub args: String,
}

impl Directive {
    pub fn new(name: &str, args: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            args: args.into(),
        }
    }
}

/// Materialised certificate/key pair, prefix-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: String,
    pub key: String,
}

/// One path-matching rule inside a server.
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub path: PathMatch,
    /// Qualified name of the owning ingress; `None` marks a built-in.
    pub ingress_ref: Option<String>,
    pub basic_auth: Option<BasicAuthConf>,
    pub proxy_pass: Option<ProxyPassConf>,
    pub ret: Option<ReturnConf>,
    pub disable_access_log: bool,
    pub directives: Vec<Directive>,
}

/// Aggregate of locations for one host.
#[derive(Debug, Clone)]
pub struct Server {
    pub server_name: String,
    pub locations: BTreeMap<String, Location>,
    pub tls: Option<TlsPaths>,
}

impl Server {
    fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            locations: BTreeMap::new(),
            tls: None,
        }
    }

    fn with_tls(server_name: &str, tls: TlsPaths) -> Self {
        Self {
            server_name: server_name.to_string(),
            locations: BTreeMap::new(),
            tls: Some(tls),
        }
    }
}

/// The http-level configuration: top-level fields plus the plain and
/// TLS-terminating server tables.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub log_format: String,
    pub access_log: String,
    pub listen: u16,
    pub listen_tls: u16,
    pub http2: bool,
    pub servers: BTreeMap<String, Server>,
    pub tls_servers: BTreeMap<String, Server>,
}

impl HttpConfig {
    /// Build the table with the catch-all server and its built-in
    /// diagnostic locations.
    pub fn new(settings: &crate::config::NginxSettings) -> Self {
        let mut catch_all = Server::new(CATCH_ALL);
        for loc in builtin_locations(&settings.prefix) {
            catch_all.locations.insert(loc.path.key(), loc);
        }

        let mut servers = BTreeMap::new();
        servers.insert(CATCH_ALL.to_string(), catch_all);

        Self {
            log_format: settings.log_format.clone(),
            access_log: settings.access_log.clone(),
            listen: settings.listen,
            listen_tls: settings.listen_tls,
            http2: settings.http2,
            servers,
            tls_servers: BTreeMap::new(),
        }
    }

    /// Insert a location under `host`.
    ///
    /// An empty host routes into the catch-all (TLS dropped, root path
    /// rejected). A TLS configuration places the location on the TLS server
    /// for the host; mismatched certificate paths fail with
    /// [`Error::TlsConflict`]. Within a server, locations are unique by
    /// canonical path key; a collision fails with
    /// [`Error::DuplicateLocation`] and leaves the prior location unchanged.
    pub fn add_location(
        &mut self,
        host: &str,
        loc: Location,
        tls: Option<TlsPaths>,
    ) -> Result<(), Error> {
        let (host, tls) = if host.is_empty() {
            if loc.path.path == "/" {
                return Err(Error::CatchAllRootForbidden);
            }
            (CATCH_ALL, None)
        } else {
            (host, tls)
        };

        let server = match tls {
            Some(paths) => match self.tls_servers.entry(host.to_string()) {
                Entry::Occupied(entry) => {
                    let server = entry.into_mut();
                    if server.tls.as_ref() != Some(&paths) {
                        return Err(Error::TlsConflict(host.to_string()));
                    }
                    server
                }
                Entry::Vacant(entry) => entry.insert(Server::with_tls(host, paths)),
            },
            None => self
                .servers
                .entry(host.to_string())
                .or_insert_with(|| Server::new(host)),
        };

        match server.locations.entry(loc.path.key()) {
            Entry::Occupied(entry) => Err(Error::DuplicateLocation(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(loc);
                Ok(())
            }
        }
    }

    /// Remove every location owned by `ingress_ref` from the plain and TLS
    /// servers of `host`, dropping servers left empty. The catch-all server
    /// and its built-ins persist.
    pub fn delete_location(&mut self, host: &str, ingress_ref: &str) {
        let host = if host.is_empty() { CATCH_ALL } else { host };

        for map in [&mut self.servers, &mut self.tls_servers] {
            if let Some(server) = map.get_mut(host) {
                server
                    .locations
                    .retain(|_, loc| loc.ingress_ref.as_deref() != Some(ingress_ref));
                if server.locations.is_empty() && host != CATCH_ALL {
                    map.remove(host);
                }
            }
        }
    }
}

/// Diagnostic locations owned by the controller itself.
fn builtin_locations(prefix: &Path) -> Vec<Location> {
    vec![
        Location {
            path: PathMatch::exact("/_/healthz"),
            ret: Some(ReturnConf {
                code: 200,
                body: "ok".to_string(),
            }),
            disable_access_log: true,
            ..Default::default()
        },
        Location {
            path: PathMatch::regex("/_/dump-config/(nginx|http)"),
            directives: vec![Directive::new(
                "alias",
                format!("{}/$1.conf", prefix.display()),
            )],
            ..Default::default()
        },
        Location {
            path: PathMatch::exact("/_/stub_status"),
            directives: vec![Directive::new("stub_status", "")],
            disable_access_log: true,
            ..Default::default()
        },
    ]
}
