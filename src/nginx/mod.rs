//! nginx supervisor: owns the configuration model, renders it to disk and
//! controls the child process with signals.
//!
//! Reload is SIGHUP, graceful shutdown is SIGQUIT. Setting `NO_NGINX=1`
//! disables all process interaction while keeping file generation intact.

pub mod conf;
pub mod render;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::NginxSettings;
use crate::error::Error;
use crate::metrics;
use crate::nginx::conf::{HttpConfig, Location, TlsPaths};

/// Sentinel environment variable disabling subprocess interaction.
pub const NO_NGINX_ENV: &str = "NO_NGINX";

const MAIN_CONF: &str = "nginx.conf";
const HTTP_CONF: &str = "http.conf";

/// Cloneable handle used to signal the child from any task.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Arc<Mutex<Option<i32>>>,
    enabled: bool,
}

impl ProcessHandle {
    fn new(enabled: bool) -> Self {
        Self {
            pid: Arc::new(Mutex::new(None)),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Ask the child to re-read its configuration. Best effort.
    pub fn reload(&self) {
        self.signal(Signal::SIGHUP, "reload");
        metrics::reload();
    }

    /// Ask the child to shut down gracefully.
    pub fn quit(&self) {
        self.signal(Signal::SIGQUIT, "quit");
    }

    fn signal(&self, signal: Signal, what: &str) {
        if !self.enabled {
            return;
        }
        let pid = *self.pid.lock().unwrap();
        match pid {
            Some(pid) => match kill(Pid::from_raw(pid), signal) {
                Ok(()) => info!(pid, signal = %signal, "nginx {what} signalled"),
                Err(e) => warn!(pid, signal = %signal, error = %e, "nginx {what} failed"),
            },
            None => warn!("nginx {what} requested but no child is running"),
        }
    }
}

/// The running (or disabled) child. `wait` resolves when the process exits;
/// in disabled mode it pends forever.
pub struct NginxProcess {
    child: Option<Child>,
    handle: ProcessHandle,
}

impl NginxProcess {
    pub fn enabled(&self) -> bool {
        self.handle.enabled
    }

    pub async fn wait(mut self) -> Result<ExitStatus, Error> {
        match self.child.take() {
            Some(mut child) => {
                let status = child.wait().await?;
                *self.handle.pid.lock().unwrap() = None;
                Ok(status)
            }
            None => std::future::pending().await,
        }
    }
}

/// Supervisor: configuration model plus child-process control.
pub struct Nginx {
    prefix: PathBuf,
    settings: NginxSettings,
    http: HttpConfig,
    process: ProcessHandle,
}

impl Nginx {
    pub fn new(settings: NginxSettings) -> Self {
        let enabled = std::env::var(NO_NGINX_ENV).as_deref() != Ok("1");
        Self {
            prefix: settings.prefix.clone(),
            http: HttpConfig::new(&settings),
            settings,
            process: ProcessHandle::new(enabled),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn http_config(&self) -> &HttpConfig {
        &self.http
    }

    pub fn process_handle(&self) -> ProcessHandle {
        self.process.clone()
    }

    pub fn add_location(
        &mut self,
        host: &str,
        loc: Location,
        tls: Option<TlsPaths>,
    ) -> Result<(), Error> {
        self.http.add_location(host, loc, tls)
    }

    pub fn delete_location(&mut self, host: &str, ingress_ref: &str) {
        self.http.delete_location(host, ingress_ref)
    }

    /// Write nginx.conf.
    pub fn build_main_config(&self) -> Result<(), Error> {
        let text = render::render_main(&self.settings);
        std::fs::write(self.prefix.join(MAIN_CONF), text)?;
        Ok(())
    }

    /// Write http.conf from the current model.
    pub fn build_http_config(&self) -> Result<(), Error> {
        let text = render::render_http(&self.http);
        std::fs::write(self.prefix.join(HTTP_CONF), text)?;
        Ok(())
    }

    /// Spawn the child with the configuration prefix. In disabled mode the
    /// returned process never runs and `wait` pends forever.
    pub fn spawn(&mut self) -> Result<NginxProcess, Error> {
        if !self.process.enabled {
            info!("nginx disabled, skipping spawn");
            return Ok(NginxProcess {
                child: None,
                handle: self.process.clone(),
            });
        }

        let child = Command::new("nginx")
            .arg("-p")
            .arg(&self.prefix)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pid = child.id().map(|pid| pid as i32);
        *self.process.pid.lock().unwrap() = pid;
        info!(?pid, prefix = %self.prefix.display(), "nginx started");

        Ok(NginxProcess {
            child: Some(child),
            handle: self.process.clone(),
        })
    }

    pub fn reload(&self) {
        self.process.reload();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_nginx(prefix: &Path) -> Nginx {
        std::env::set_var(NO_NGINX_ENV, "1");
        let settings = NginxSettings {
            prefix: prefix.to_path_buf(),
            ..NginxSettings::default()
        };
        Nginx::new(settings)
    }

    #[test]
    fn test_build_configs_write_files() {
        let dir = tempfile::tempdir().unwrap();
        let nginx = test_nginx(dir.path());

        nginx.build_main_config().unwrap();
        nginx.build_http_config().unwrap();

        let main = std::fs::read_to_string(dir.path().join(MAIN_CONF)).unwrap();
        let http = std::fs::read_to_string(dir.path().join(HTTP_CONF)).unwrap();
        assert!(main.contains("daemon off;"));
        assert!(http.contains("server_name _;"));
    }

    #[tokio::test]
    async fn test_disabled_mode_skips_process_interaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut nginx = test_nginx(dir.path());

        let process = nginx.spawn().unwrap();
        assert!(!process.enabled());

        // Signals are no-ops without a child.
        nginx.reload();
        nginx.process_handle().quit();

        // File generation still works.
        nginx.build_http_config().unwrap();
        assert!(dir.path().join(HTTP_CONF).exists());
    }
}
