//! Updater log checks
//!
//! The updater writes `update.log` into the updates directory. Its absolute
//! paths, platform error codes and mode banners differ from run to run, so
//! the log is normalized before it is compared with a reference log.

use crate::error::{Result, UpdateError};
use crate::orchestrator::UpdateMode;
use crate::paths::files;
use std::path::{Path, PathBuf};

/// Line fragments after which the rest of the line is dropped
const VOLATILE_SUFFIXES: &[&str] = &[
    "SOURCE DIRECTORY",
    "DESTINATION DIRECTORY",
    "callback app open attempt",
    ", err:",
];

const BACKGROUND_BANNER: &str = "Performing a background update";
const REPLACE_BANNER: &str = "Performing a replace request";

/// What the update log must look like after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateLogExpectation {
    /// Normalized log must equal this reference file
    Reference(PathBuf),

    /// Raw log must contain this text
    Contains(String),
}

/// Strip run-specific noise from an update log
pub fn normalize(log: &str, mode: UpdateMode) -> String {
    let mut log = log.replace('\r', "");

    if matches!(mode, UpdateMode::Background | UpdateMode::Switch) {
        log = log.replacen(BACKGROUND_BANNER, "", 1);
    }
    if mode == UpdateMode::Switch {
        log = log.replacen(REPLACE_BANNER, "", 1);
    }

    log.lines()
        .filter(|line| !(mode == UpdateMode::Switch && line.starts_with("Begin moving")))
        .map(|line| {
            let cut = VOLATILE_SUFFIXES
                .iter()
                .filter_map(|marker| line.find(marker))
                .min()
                .unwrap_or(line.len());
            line[..cut].replace("non-fatal error ", "")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Check the update log in `updates_dir`
pub fn check(
    updates_dir: &Path,
    mode: UpdateMode,
    expectation: &UpdateLogExpectation,
) -> Result<()> {
    let log_path = files::log_file(updates_dir);
    let raw = std::fs::read_to_string(&log_path).map_err(|e| UpdateError::io(&log_path, e))?;

    match expectation {
        UpdateLogExpectation::Contains(needle) => {
            if raw.contains(needle.as_str()) {
                tracing::debug!("log file does contain: {}", needle);
                Ok(())
            } else {
                tracing::info!("log file contents:\n{}", raw);
                Err(UpdateError::UpdateLog(format!("log does not contain {:?}", needle)))
            }
        }
        UpdateLogExpectation::Reference(reference) => {
            let expected = std::fs::read_to_string(reference)
                .map_err(|e| UpdateError::io(reference, e))?
                .replace('\r', "");
            let expected = expected.trim_matches('\n');
            let actual = normalize(&raw, mode);

            if actual == expected {
                tracing::debug!("log contents are correct");
                Ok(())
            } else {
                tracing::info!("normalized log contents:\n{}", actual);
                Err(UpdateError::UpdateLog(format!(
                    "log differs from {}",
                    reference.display()
                )))
            }
        }
    }
}
