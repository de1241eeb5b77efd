//! Error taxonomy shared by every component of the core

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the orchestration core.
///
/// None of these leave the registry, the certificate store or the routing
/// table partially updated: a failing operation mutates nothing.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed domain or target
    #[error("{0}")]
    Validation(String),

    /// Domain already registered, as custom or process-derived
    #[error("domain already exists: {0}")]
    Conflict(String),

    /// Hosts file or service manager refused the action
    #[error("permission denied: {0}")]
    Permission(String),

    /// Proxy listener could not be bound
    #[error("cannot bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// Certificate issuance failed
    #[error("certificate authority error: {0}")]
    Ca(String),

    /// Referenced id or domain does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Root CA could not be installed into the trust store
    #[error("install failed: {0}")]
    Install(String),

    /// Service manager failure other than missing privilege
    #[error("service error: {0}")]
    Service(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable kind, used by the control API
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Conflict(_) => "conflict",
            Error::Permission(_) => "permission",
            Error::Bind { .. } => "bind",
            Error::Ca(_) => "ca",
            Error::NotFound(_) => "not_found",
            Error::Install(_) => "install",
            Error::Service(_) => "service",
            Error::Storage(_) => "storage",
            Error::Io(_) => "io",
        }
    }
}
