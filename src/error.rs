//! Error taxonomy for the replay engine.
//!
//! Configuration problems are fatal. Backend submission failures are
//! recovered per batch by the loaders and replayers, which only log them.
//! Readiness timeouts and early process exits abort the session.

use std::path::PathBuf;
use std::time::Duration;

pub type ReplayResult<T> = Result<T, ReplayError>;

#[derive(Debug)]
pub enum ReplayError {
    /// Bad or missing configuration, unknown anchor strategy or mode.
    Config(String),
    /// A dataset file could not be opened or read.
    Dataset { path: PathBuf, reason: String },
    /// HTTP failure, refused connection or unexpected status from a backend.
    Backend { backend: &'static str, reason: String },
    /// Out-of-process replayer never signalled readiness.
    ReadinessTimeout { waited: Duration, diagnostics: String },
    /// Out-of-process replayer exited before it became ready.
    ProcessExited { status: String, logs: String },
    /// Another session already owns the namespace.
    SessionConflict(String),
    Cancelled,
    Io(std::io::Error),
}

impl ReplayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn backend(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            reason: reason.into(),
        }
    }

    pub fn dataset(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Dataset {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Fatal errors end the session; everything else is recoverable per batch.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Backend { .. })
    }
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Dataset { path, reason } => {
                write!(f, "dataset error in {}: {}", path.display(), reason)
            }
            Self::Backend { backend, reason } => {
                write!(f, "{} submission failed: {}", backend, reason)
            }
            Self::ReadinessTimeout {
                waited,
                diagnostics,
            } => write!(
                f,
                "replayer not ready after {:.0}s\n{}",
                waited.as_secs_f64(),
                diagnostics
            ),
            Self::ProcessExited { status, logs } => {
                write!(f, "replayer exited early (status: {})\n{}", status, logs)
            }
            Self::SessionConflict(ns) => {
                write!(f, "namespace '{}' already has an active replay session", ns)
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReplayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<reqwest::Error> for ReplayError {
    fn from(e: reqwest::Error) -> Self {
        let backend = if e.is_timeout() { "http (timeout)" } else { "http" };
        Self::Backend {
            backend,
            reason: e.to_string(),
        }
    }
}
