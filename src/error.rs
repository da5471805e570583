//! Startup-fatal error taxonomy. Everything the Reconciler can
//! reasonably continue past is logged and dropped at its own boundary
//! (see `engine::reconciler`); only these two kinds ever abort the
//! process, and only during startup.

use std::fmt;

#[derive(Debug)]
pub enum StartupError {
    /// Credentials/kubeconfig invalid, both explicit and in-cluster
    /// discovery failed.
    Config(String),
    /// A required pinned table could not be opened.
    MapUnavailable(String),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Config(msg) => write!(f, "configuration error: {msg}"),
            StartupError::MapUnavailable(msg) => write!(f, "pinned map unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StartupError {}
