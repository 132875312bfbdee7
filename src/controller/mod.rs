//! Ingress reconciler.
//!
//! A single task owns all mutable state: the ingress cache, the
//! reference-counted secret informer and the nginx model. Watch events for
//! both resources are funneled through mpsc channels and handled strictly in
//! receive order, so no locking is needed anywhere in the reconcile path.

pub mod annotation;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::Error;
use crate::kube::client::Client;
use crate::kube::informer::Informer;
use crate::kube::ingress::{self, Ingress};
use crate::kube::secret::{self, Secret, SecretType, AUTH_KEY, TLS_CERT_KEY, TLS_KEY_KEY};
use crate::kube::{self, EventType, KubeObject, Metadata, WatchEvent};
use crate::metrics;
use crate::nginx::conf::{
    BasicAuthConf, Directive, Location, PathMatch, ProxyPassConf, ReturnConf, TlsPaths,
};
use crate::nginx::{Nginx, NginxProcess};

const AUTH_FILE_DIR: &str = "authfiles";
const TLS_DIR: &str = "tls";
const BASIC_AUTH_REALM: &str = "Authentication required";

const EVENT_QUEUE_DEPTH: usize = 64;

pub struct Controller {
    client: Arc<dyn Client>,
    class: String,
    iss_cache: HashMap<String, Ingress>,
    secrets: Informer<Secret>,
    nginx: Nginx,
}

impl Controller {
    pub fn new(client: Arc<dyn Client>, class: String, nginx: Nginx) -> Self {
        let secrets = Informer::new(client.clone(), secret::read_path);
        Self {
            client,
            class,
            iss_cache: HashMap::new(),
            secrets,
            nginx,
        }
    }

    pub fn nginx(&self) -> &Nginx {
        &self.nginx
    }

    pub fn secret_ref_count(&self, namespace: &str, name: &str) -> usize {
        self.secrets.ref_count(namespace, name)
    }

    pub fn has_cached(&self, full_name: &str) -> bool {
        self.iss_cache.contains_key(full_name)
    }

    pub fn cached_ingress_count(&self) -> usize {
        self.iss_cache.len()
    }

    /// Startup reconciliation: list all ingresses, apply every in-scope one
    /// without reloading in between, then render the http configuration
    /// once. Errors listing or rendering are fatal; per-ingress errors are
    /// logged and skipped.
    pub async fn bootstrap(&mut self) -> Result<(), Error> {
        std::fs::create_dir_all(self.nginx.prefix().join(AUTH_FILE_DIR))?;
        std::fs::create_dir_all(self.nginx.prefix().join(TLS_DIR))?;

        let iss: Vec<Ingress> = kube::list(self.client.as_ref(), ingress::LIST_PATH).await?;
        info!(count = iss.len(), "listed ingresses");

        for is in iss {
            if !ingress::matches_class(&is, &self.class) {
                continue;
            }
            if let Err(e) = self.add_ingress(&is).await {
                warn!(ingress = %is.full_name(), error = %e, "apply listed ingress");
                metrics::reconcile_error(e.reason());
            }
        }

        self.nginx.build_http_config()
    }

    pub fn spawn_proxy(&mut self) -> Result<NginxProcess, Error> {
        self.nginx.spawn()
    }

    pub fn proxy_handle(&self) -> crate::nginx::ProcessHandle {
        self.nginx.process_handle()
    }

    /// Event loop. Runs the ingress and secret watches concurrently and
    /// consumes their events sequentially until `shutdown` fires.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        let (ingress_tx, mut ingress_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (secret_tx, mut secret_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        tokio::spawn(kube::watch::<Ingress>(
            self.client.clone(),
            ingress::WATCH_PATH,
            ingress_tx,
            shutdown.clone(),
        ));
        tokio::spawn(kube::watch::<Secret>(
            self.client.clone(),
            secret::WATCH_PATH,
            secret_tx,
            shutdown.clone(),
        ));

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                Some(event) = ingress_rx.recv() => self.on_ingress_event(event).await,
                Some(event) = secret_rx.recv() => self.on_secret_event(event),
                _ = shutdown.changed() => {
                    info!("reconciler stopping");
                    return;
                }
            }
        }
    }

    /// Dispatch one ingress watch event.
    pub async fn on_ingress_event(&mut self, event: WatchEvent<Ingress>) {
        metrics::watch_event("ingress", event.event_type);

        let is = event.object;
        if !ingress::matches_class(&is, &self.class) {
            return;
        }
        let name = is.full_name();

        let need_reload = match event.event_type {
            EventType::Added => {
                if self.iss_cache.contains_key(&name) {
                    false
                } else {
                    info!(ingress = %name, "add ingress");
                    match self.add_ingress(&is).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(ingress = %name, error = %e, "add ingress");
                            metrics::reconcile_error(e.reason());
                            false
                        }
                    }
                }
            }
            EventType::Deleted => {
                if self.iss_cache.contains_key(&name) {
                    info!(ingress = %name, "delete ingress");
                    self.delete_cached_ingress(&name);
                    true
                } else {
                    false
                }
            }
            EventType::Modified => {
                if !self.iss_cache.contains_key(&name) {
                    false
                } else {
                    info!(ingress = %name, "modify ingress");
                    // Tear down with the cached object so the old secret
                    // references are released, then apply the new one.
                    self.delete_cached_ingress(&name);
                    match self.add_ingress(&is).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(ingress = %name, error = %e, "re-add modified ingress");
                            metrics::reconcile_error(e.reason());
                            false
                        }
                    }
                }
            }
        };

        if need_reload {
            self.build_and_reload();
        }
    }

    /// Dispatch one secret watch event. A modification of a referenced
    /// secret rewrites its materialised files and asks nginx to reload; the
    /// configuration itself is unchanged.
    pub fn on_secret_event(&mut self, event: WatchEvent<Secret>) {
        metrics::watch_event("secret", event.event_type);

        let Some(sec) = self.secrets.apply(event) else {
            return;
        };
        let name = sec.full_name();
        info!(secret = %name, "referenced secret modified");

        let result = match sec.secret_type {
            SecretType::Opaque => materialise_auth(self.nginx.prefix(), &sec, true).map(|_| ()),
            SecretType::Tls => materialise_tls(self.nginx.prefix(), &sec, true).map(|_| ()),
            SecretType::Other => return,
        };

        match result {
            Ok(()) => self.nginx.reload(),
            Err(e) => {
                warn!(secret = %name, error = %e, "rewrite secret files");
                metrics::reconcile_error(e.reason());
            }
        }
    }

    /// Translate one ingress into locations, acquiring its secrets on the
    /// way. The ingress enters the cache first and stays there even when
    /// parts of it fail to apply.
    async fn add_ingress(&mut self, is: &Ingress) -> Result<(), Error> {
        let name = is.full_name();
        self.iss_cache.insert(name.clone(), is.clone());

        let mut basic_auth = None;
        if let Some((auth_ns, auth_name)) = auth_secret_ref(is) {
            let user_file = self.setup_auth_secret(&auth_ns, &auth_name, false).await?;
            basic_auth = Some(BasicAuthConf {
                realm: BASIC_AUTH_REALM.to_string(),
                user_file,
            });
        }

        let directives = timeout_directives(&is.metadata);
        let rewrite = annotation::value(&is.metadata, annotation::REWRITE_TARGET)
            .map(|target| target.to_string());
        let use_regex = annotation::is_true(&is.metadata, annotation::USE_REGEX);
        let disable_access_log = annotation::is_false(&is.metadata, annotation::ENABLE_ACCESS_LOG);
        let force_ssl = annotation::is_true(&is.metadata, annotation::FORCE_SSL_REDIRECT);

        // One acquisition per distinct TLS secret; hosts listed under
        // several entries keep the first one.
        let mut tls_material: HashMap<&str, Option<TlsPaths>> = HashMap::new();
        let mut tls_hosts: HashMap<&str, &str> = HashMap::new();
        for tls in &is.spec.tls {
            if !tls_material.contains_key(tls.secret_name.as_str()) {
                let paths = match self
                    .setup_tls_secret(&is.metadata.namespace, &tls.secret_name, false)
                    .await
                {
                    Ok(paths) => Some(paths),
                    Err(e) => {
                        warn!(ingress = %name, secret = %tls.secret_name, error = %e, "setup tls secret");
                        metrics::reconcile_error(e.reason());
                        None
                    }
                };
                tls_material.insert(tls.secret_name.as_str(), paths);
            }
            for host in &tls.hosts {
                tls_hosts.entry(host.as_str()).or_insert(tls.secret_name.as_str());
            }
        }

        for rule in &is.spec.rules {
            let tls_conf = match tls_hosts.get(rule.host.as_str()) {
                Some(secret_name) => {
                    match tls_material.get(*secret_name).and_then(Clone::clone) {
                        Some(paths) => Some(paths),
                        None => {
                            warn!(ingress = %name, host = %rule.host, "skipping rule without tls material");
                            continue;
                        }
                    }
                }
                None => None,
            };

            for path in &rule.http.paths {
                let mut loc = Location {
                    path: PathMatch {
                        path: path.path.clone(),
                        path_type: path.path_type,
                        regex: use_regex,
                    },
                    ingress_ref: Some(name.clone()),
                    basic_auth: basic_auth.clone(),
                    disable_access_log,
                    directives: directives.clone(),
                    ..Default::default()
                };
                match &rewrite {
                    Some(target) => {
                        loc.ret = Some(ReturnConf {
                            code: 301,
                            body: target.clone(),
                        });
                    }
                    None => {
                        loc.proxy_pass = Some(ProxyPassConf {
                            upstream: format!(
                                "http://{}.{}:{}",
                                path.backend.service.name,
                                is.metadata.namespace,
                                path.backend.service.port.number
                            ),
                        });
                    }
                }

                if let Err(e) = self.nginx.add_location(&rule.host, loc, tls_conf.clone()) {
                    warn!(ingress = %name, path = %path.path, error = %e, "add location");
                    metrics::reconcile_error(e.reason());
                }
            }

            if tls_conf.is_some() && force_ssl {
                let loc = Location {
                    path: PathMatch::prefix("/"),
                    ingress_ref: Some(name.clone()),
                    ret: Some(ReturnConf {
                        code: 301,
                        body: "https://$host$request_uri".to_string(),
                    }),
                    ..Default::default()
                };
                if let Err(e) = self.nginx.add_location(&rule.host, loc, None) {
                    warn!(ingress = %name, host = %rule.host, error = %e, "add ssl redirect");
                    metrics::reconcile_error(e.reason());
                }
            }
        }

        Ok(())
    }

    fn delete_cached_ingress(&mut self, full_name: &str) {
        if let Some(is) = self.iss_cache.remove(full_name) {
            self.delete_ingress(&is);
        }
    }

    /// Undo everything `add_ingress` did for this ingress: locations on both
    /// sides of every rule host, the auth secret reference and one reference
    /// per distinct TLS secret.
    fn delete_ingress(&mut self, is: &Ingress) {
        let name = is.full_name();
        for rule in &is.spec.rules {
            self.nginx.delete_location(&rule.host, &name);
        }

        if let Some((auth_ns, auth_name)) = auth_secret_ref(is) {
            self.release_secret(&auth_ns, &auth_name);
        }

        let mut seen = HashSet::new();
        for tls in &is.spec.tls {
            if seen.insert(tls.secret_name.as_str()) {
                self.release_secret(&is.metadata.namespace, &tls.secret_name);
            }
        }
    }

    fn release_secret(&mut self, namespace: &str, name: &str) {
        if let Some(sec) = self.secrets.release(namespace, name) {
            info!(secret = %sec.full_name(), "releasing secret");
            remove_secret_files(self.nginx.prefix(), &sec);
        }
    }

    /// Acquire the auth secret and make sure its htpasswd file exists on
    /// disk. The reference is dropped again when materialisation fails.
    async fn setup_auth_secret(
        &mut self,
        namespace: &str,
        name: &str,
        remake: bool,
    ) -> Result<String, Error> {
        let sec = self.secrets.get(namespace, name).await?;
        match materialise_auth(self.nginx.prefix(), &sec, remake) {
            Ok(user_file) => Ok(user_file),
            Err(e) => {
                self.release_secret(namespace, name);
                Err(e)
            }
        }
    }

    /// Acquire a TLS secret and make sure its certificate and key exist on
    /// disk. The reference is dropped again when materialisation fails.
    async fn setup_tls_secret(
        &mut self,
        namespace: &str,
        name: &str,
        remake: bool,
    ) -> Result<TlsPaths, Error> {
        let sec = self.secrets.get(namespace, name).await?;
        match materialise_tls(self.nginx.prefix(), &sec, remake) {
            Ok(paths) => Ok(paths),
            Err(e) => {
                self.release_secret(namespace, name);
                Err(e)
            }
        }
    }

    fn build_and_reload(&mut self) {
        if let Err(e) = self.nginx.build_http_config() {
            error!(error = %e, "build http config");
            metrics::reconcile_error(e.reason());
            return;
        }
        self.nginx.reload();
    }
}

/// Auth secret reference from the annotations: name from `auth-secret`,
/// namespace from `auth-secret-namespace` or the ingress's own namespace.
fn auth_secret_ref(is: &Ingress) -> Option<(String, String)> {
    let name = annotation::value(&is.metadata, annotation::AUTH_SECRET)?;
    let namespace = annotation::value(&is.metadata, annotation::AUTH_SECRET_NAMESPACE)
        .unwrap_or(&is.metadata.namespace);
    Some((namespace.to_string(), name.to_string()))
}

fn timeout_directives(md: &Metadata) -> Vec<Directive> {
    let mut directives = Vec::new();
    for (key, directive) in [
        (annotation::PROXY_READ_TIMEOUT, "proxy_read_timeout"),
        (annotation::PROXY_CONNECT_TIMEOUT, "proxy_connect_timeout"),
        (annotation::PROXY_SEND_TIMEOUT, "proxy_send_timeout"),
    ] {
        if let Some(value) = annotation::positive_int(md, key) {
            directives.push(Directive::new(directive, format!("{value}s")));
        }
    }
    directives
}

fn secret_file_name(md: &Metadata) -> String {
    format!("{}-{}", md.namespace, md.name)
}

/// Write the htpasswd file for an Opaque auth secret and return its
/// prefix-relative path. With `remake` unset an existing file is reused.
fn materialise_auth(prefix: &Path, sec: &Secret, remake: bool) -> Result<String, Error> {
    let rel = PathBuf::from(AUTH_FILE_DIR).join(secret_file_name(&sec.metadata));
    let abs = prefix.join(&rel);

    if remake || !abs.exists() {
        let auth = sec.decode_key(AUTH_KEY)?;
        std::fs::write(&abs, auth)?;
    }

    Ok(rel.to_string_lossy().into_owned())
}

/// Write the certificate/key pair for a TLS secret and return their
/// prefix-relative paths. With `remake` unset existing files are reused.
fn materialise_tls(prefix: &Path, sec: &Secret, remake: bool) -> Result<TlsPaths, Error> {
    let rel_dir = PathBuf::from(TLS_DIR).join(secret_file_name(&sec.metadata));
    let abs_dir = prefix.join(&rel_dir);
    std::fs::create_dir_all(&abs_dir)?;

    let write_key = |key: &'static str| -> Result<String, Error> {
        let abs = abs_dir.join(key);
        if remake || !abs.exists() {
            std::fs::write(&abs, sec.decode_key(key)?)?;
        }
        Ok(rel_dir.join(key).to_string_lossy().into_owned())
    };

    let key = write_key(TLS_KEY_KEY)?;
    let cert = write_key(TLS_CERT_KEY)?;
    Ok(TlsPaths { cert, key })
}

/// Remove whatever a released secret left on disk.
fn remove_secret_files(prefix: &Path, sec: &Secret) {
    let file_name = secret_file_name(&sec.metadata);
    let result = match sec.secret_type {
        SecretType::Opaque => std::fs::remove_file(prefix.join(AUTH_FILE_DIR).join(&file_name)),
        SecretType::Tls => std::fs::remove_dir_all(prefix.join(TLS_DIR).join(&file_name)),
        SecretType::Other => return,
    };
    if let Err(e) = result {
        warn!(secret = %sec.full_name(), error = %e, "remove secret files");
    }
}
