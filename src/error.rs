//! Error types for update attempts.

use crate::status::UpdateStatus;
use crate::verify::Mismatch;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch {program}: {source}")]
    ProcessLaunch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}")]
    ProcessExit { program: PathBuf, code: i32 },

    #[error("Timed out waiting for {what} after {iterations} checks ({elapsed:?})")]
    TimedOut {
        what: String,
        iterations: u32,
        elapsed: Duration,
    },

    #[error("Tree verification found {} mismatch(es)", .0.len())]
    Verification(Vec<Mismatch>),

    #[error("Expected status {expected}, observed {observed}")]
    StateMismatch {
        expected: UpdateStatus,
        observed: UpdateStatus,
    },

    #[error("Unrecognized status token: {0:?}")]
    UnknownStatus(String),

    #[error("Service log check failed: {0}")]
    ServiceLog(String),

    #[error("Callback log mismatch: expected {expected:?}, observed {observed:?}")]
    CallbackMismatch { expected: String, observed: String },

    #[error("Signature check failed for {path}: {reason}")]
    Signature { path: PathBuf, reason: String },

    #[error("Update log check failed: {0}")]
    UpdateLog(String),
}

impl UpdateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdateError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error ends the attempt before a terminal status is seen
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UpdateError::Io { .. }
                | UpdateError::ProcessLaunch { .. }
                | UpdateError::TimedOut { .. }
                | UpdateError::StateMismatch { .. }
                | UpdateError::UnknownStatus(_)
                | UpdateError::Signature { .. }
        )
    }

    /// Short stable name for reports and logs
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Io { .. } => "io",
            UpdateError::ProcessLaunch { .. } => "process-launch",
            UpdateError::ProcessExit { .. } => "process-exit",
            UpdateError::TimedOut { .. } => "timed-out",
            UpdateError::Verification(_) => "verification",
            UpdateError::StateMismatch { .. } => "state-mismatch",
            UpdateError::UnknownStatus(_) => "unknown-status",
            UpdateError::ServiceLog(_) => "service-log",
            UpdateError::CallbackMismatch { .. } => "callback-mismatch",
            UpdateError::Signature { .. } => "signature",
            UpdateError::UpdateLog(_) => "update-log",
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
