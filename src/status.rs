//! Update Status Store
//!
//! Typed access to the persisted status token (`update.status`) and version
//! token (`update.version`) shared with the external updater. All I/O is
//! synchronous and uncached: every read goes to disk.

use crate::error::{Result, UpdateError};
use crate::paths::files;
use std::fmt;
use std::path::{Path, PathBuf};

/// Progress of an update attempt as persisted in the status file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// Ready to be applied by the unprivileged updater
    Pending,

    /// Handed to the privileged service, not yet being applied
    PendingService,

    /// The updater is applying the archive
    Applying,

    /// Staged into the updated directory, waiting for a switch
    Applied,

    /// Staged by the privileged service
    AppliedService,

    Succeeded,

    /// Staged update was switched into place
    SwitchSucceeded,

    /// Failed; the detail is usually a platform-dependent error code
    Failed(Option<String>),
}

impl UpdateStatus {
    /// Parse an on-disk token (`failed: 7` keeps `7` as the detail)
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        let (state, detail) = match token.split_once(':') {
            Some((state, detail)) => (state.trim(), Some(detail.trim())),
            None => (token, None),
        };

        let status = match state {
            "pending" => UpdateStatus::Pending,
            "pending-service" => UpdateStatus::PendingService,
            "applying" => UpdateStatus::Applying,
            "applied" => UpdateStatus::Applied,
            "applied-service" => UpdateStatus::AppliedService,
            "succeeded" => UpdateStatus::Succeeded,
            "switch-succeeded" => UpdateStatus::SwitchSucceeded,
            "failed" => UpdateStatus::Failed(detail.filter(|d| !d.is_empty()).map(str::to_string)),
            _ => return Err(UpdateError::UnknownStatus(token.to_string())),
        };

        if detail.is_some() && !matches!(status, UpdateStatus::Failed(_)) {
            return Err(UpdateError::UnknownStatus(token.to_string()));
        }

        Ok(status)
    }

    /// State name without any failure detail
    pub fn family(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::PendingService => "pending-service",
            UpdateStatus::Applying => "applying",
            UpdateStatus::Applied => "applied",
            UpdateStatus::AppliedService => "applied-service",
            UpdateStatus::Succeeded => "succeeded",
            UpdateStatus::SwitchSucceeded => "switch-succeeded",
            UpdateStatus::Failed(_) => "failed",
        }
    }

    /// Everything except `applying` and `pending-service` ends polling
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UpdateStatus::Applying | UpdateStatus::PendingService)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, UpdateStatus::Failed(_))
    }

    /// Compare against an expected status. Failures only compare the family
    /// because the trailing code differs between platforms.
    pub fn satisfies(&self, expected: &UpdateStatus) -> bool {
        match (self, expected) {
            (UpdateStatus::Failed(_), UpdateStatus::Failed(None)) => true,
            _ => self == expected,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStatus::Failed(Some(detail)) => write!(f, "failed: {}", detail),
            other => f.write_str(other.family()),
        }
    }
}

impl std::str::FromStr for UpdateStatus {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        UpdateStatus::parse(s)
    }
}

/// Reader/writer for the status and version files of one updates directory
#[derive(Debug, Clone)]
pub struct StatusStore {
    updates_dir: PathBuf,
}

impl StatusStore {
    pub fn new(updates_dir: impl Into<PathBuf>) -> Self {
        Self {
            updates_dir: updates_dir.into(),
        }
    }

    pub fn status_path(&self) -> PathBuf {
        files::status_file(&self.updates_dir)
    }

    pub fn version_path(&self) -> PathBuf {
        files::version_file(&self.updates_dir)
    }

    pub fn write_status(&self, status: &UpdateStatus) -> Result<()> {
        write_token(&self.status_path(), &status.to_string())
    }

    pub fn read_status(&self) -> Result<UpdateStatus> {
        UpdateStatus::parse(&self.read_status_token()?)
    }

    /// Raw trimmed token, for callers that tolerate unknown values
    pub fn read_status_token(&self) -> Result<String> {
        read_token(&self.status_path())
    }

    pub fn write_version(&self, version: &str) -> Result<()> {
        write_token(&self.version_path(), version)
    }

    pub fn read_version(&self) -> Result<String> {
        read_token(&self.version_path())
    }
}

fn write_token(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{}\n", token)).map_err(|e| UpdateError::io(path, e))
}

fn read_token(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| UpdateError::io(path, e))?;
    Ok(contents.trim().to_string())
}
