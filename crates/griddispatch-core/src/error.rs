//! Errors that abort a whole dispatch run.
//!
//! Everything here is fatal. Failures scoped to one batch or one branch of
//! the walk are recorded in the
//! [`DispatchReport`](crate::dispatch::DispatchReport) and never surface as
//! a `DispatchError`.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::hierarchy::ProbeError;

/// Fatal dispatch errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The task or target command line was empty.
    #[error("command is empty")]
    EmptyCommand,

    /// The address probe failed.
    #[error("address discovery failed: {0}")]
    Probe(#[from] ProbeError),

    /// The directory-mode root does not exist.
    #[error("root path does not exist: {}", path.display())]
    RootNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The directory-mode root exists but is not a directory.
    #[error("root path is not a directory: {}", path.display())]
    RootNotDirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// The root path could not be inspected.
    #[error("failed to inspect root path {}: {source}", path.display())]
    RootIo {
        /// The root path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No worker executable was configured and the current one could not
    /// be determined.
    #[error("cannot determine worker executable: {0}")]
    WorkerExe(#[source] std::io::Error),

    /// The configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
