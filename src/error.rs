use thiserror::Error;

/// Errors surfaced by the controller.
///
/// Watch-loop transport and decode failures are recovered locally by the
/// reconnect logic; per-ingress failures are logged and skipped by the
/// reconciler; everything else is fatal at startup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("control plane transport: {0}")]
    Transport(String),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("secret data is not valid base64: {0}")]
    SecretEncoding(#[from] base64::DecodeError),

    #[error("secret missing `{0}` key")]
    MissingSecretKey(&'static str),

    #[error("duplicated location {0}")]
    DuplicateLocation(String),

    #[error("conflicting tls material for host {0}")]
    TlsConflict(String),

    #[error("catch-all root location is not allowed")]
    CatchAllRootForbidden,

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("nginx exited: {0}")]
    ChildExit(std::process::ExitStatus),

    #[error("not running inside a cluster")]
    NotInCluster,
}

impl Error {
    /// Stable label for the error counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Decode(_) => "decode",
            Error::SecretEncoding(_) => "secret_encoding",
            Error::MissingSecretKey(_) => "missing_secret_key",
            Error::DuplicateLocation(_) => "duplicate_location",
            Error::TlsConflict(_) => "tls_conflict",
            Error::CatchAllRootForbidden => "catch_all_root",
            Error::Io(_) => "io",
            Error::ChildExit(_) => "child_exit",
            Error::NotInCluster => "not_in_cluster",
        }
    }
}
