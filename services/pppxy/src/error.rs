//! Error types for pppxy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by configuration loading and instance lifecycle.
///
/// Per-connection failures never show up here; they are logged and
/// contained inside the connection task.
#[derive(Debug, Error)]
pub enum PppxyError {
    /// Could not read the config file.
    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Config file is not valid YAML or does not match the schema.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Config parsed but failed validation.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// PROXY protocol version other than 1 or 2.
    #[error("unsupported proxy protocol version {0} (expected 1 or 2)")]
    UnsupportedVersion(u8),

    /// Listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `serve` called before `listen`.
    #[error("listener {addr} is not bound")]
    NotListening { addr: String },

    /// `listen` or `serve` called twice.
    #[error("listener {addr} is already listening")]
    AlreadyListening { addr: String },

    /// Operation on an instance that was closed.
    #[error("listener {addr} is closed")]
    InstanceClosed { addr: String },

    /// The accept loop went away without confirming the listener was released.
    #[error("accept loop for {addr} exited without releasing the listener")]
    AcceptLoopLost { addr: String },

    /// A supervised task panicked or was aborted.
    #[error("instance task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PppxyError>;
