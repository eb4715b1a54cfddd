//! Centralized Path and Name Definitions
//!
//! Every well-known file name, environment variable and helper binary name
//! shared with the external updater and the privileged service lives here.

/// Files inside the updates directory and the apply-to directory
pub mod files {
    use std::path::{Path, PathBuf};

    /// Persisted status token written by the updater
    pub const STATUS: &str = "update.status";

    /// Persisted version token written before an attempt
    pub const VERSION: &str = "update.version";

    /// The updater's own log
    pub const LOG: &str = "update.log";

    /// Name the staged patch archive is given inside the updates directory
    pub const ARCHIVE: &str = "update.mar";

    /// Updater settings file inside the apply-to directory
    pub const SETTINGS_INI: &str = "updater-settings.ini";

    /// Backup of the settings file while an attempt runs
    pub const SETTINGS_INI_BAK: &str = "updater-settings.ini.bak";

    /// Subdirectory background and switch updates are applied into
    pub const UPDATED_DIR: &str = "updated";

    pub fn status_file(updates_dir: &Path) -> PathBuf {
        updates_dir.join(STATUS)
    }

    pub fn version_file(updates_dir: &Path) -> PathBuf {
        updates_dir.join(VERSION)
    }

    pub fn log_file(updates_dir: &Path) -> PathBuf {
        updates_dir.join(LOG)
    }

    pub fn archive_file(updates_dir: &Path) -> PathBuf {
        updates_dir.join(ARCHIVE)
    }

    pub fn updated_dir(apply_dir: &Path) -> PathBuf {
        apply_dir.join(UPDATED_DIR)
    }
}

/// Environment variables consumed by the updater and the service
pub mod env {
    /// Overrides the root directory the updater looks for updates in
    pub const UPDATE_ROOT_OVERRIDE: &str = "UPSTAGE_UPDATE_ROOT_OVERRIDE";

    /// Overrides the installation directory the updater applies to
    pub const APPDIR_OVERRIDE: &str = "UPSTAGE_APPDIR_OVERRIDE";

    /// Skips hashing of the installation path when locating the updates dir
    pub const NO_HASH_DIR: &str = "UPSTAGE_NO_HASH_DIR";

    /// Requests a background (staged) update
    pub const UPDATE_BACKGROUND: &str = "UPSTAGE_UPDATE_BACKGROUND";

    /// Forbids falling back to the unprivileged updater when the service fails
    pub const NO_SERVICE_FALLBACK: &str = "UPSTAGE_NO_SERVICE_FALLBACK";

    /// Forbids the copy fallback when a switch (replace) request fails
    pub const NO_REPLACE_FALLBACK: &str = "UPSTAGE_NO_REPLACE_FALLBACK";

    /// Dynamic linker search path inherited by the updater
    pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";
}

/// Privileged service binaries and log
pub mod service {
    use std::path::PathBuf;

    /// Persistent service binary
    pub const SERVICE_BIN: &str = "upstage-service";

    /// Temporary copy the installer runs while upgrading the service
    pub const TEMP_SERVICE_BIN: &str = "upstage-service-tmp";

    /// Service installer, started asynchronously during updates
    pub const INSTALLER_BIN: &str = "upstage-service-installer";

    /// Line the service writes once it has handed the update to the updater
    pub const SUCCESSFUL_LAUNCH_MARKER: &str = "Process was started... waiting on result.";

    /// Default service log location (~/.local/share/upstage/logs/service.log)
    pub fn default_log_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|p| p.join("upstage").join("logs").join("service.log"))
    }
}

/// Artifacts the updater must never leave behind
pub mod artifacts {
    use std::path::Path;

    /// Extension of intermediate patch files in the updates directory
    pub const PATCH_EXTENSION: &str = "patch";

    /// Extension of per-file backups made while applying
    pub const BACKUP_EXTENSION: &str = "backup";

    pub fn default_reserved() -> Vec<String> {
        vec![PATCH_EXTENSION.to_string(), BACKUP_EXTENSION.to_string()]
    }

    /// Whether the path carries one of the reserved extensions
    pub fn is_reserved(path: &Path, reserved: &[String]) -> bool {
        path.extension()
            .map(|ext| {
                let ext = ext.to_string_lossy();
                reserved.iter().any(|r| r.as_str() == ext)
            })
            .unwrap_or(false)
    }
}

/// Safety validation for paths before clearing them
pub mod safety {
    use std::path::{Component, Path};

    /// Validate that a directory is safe to clear before staging
    ///
    /// Refuses the filesystem root, the home directory, well-known system
    /// directories and anything shallower than two normal components.
    pub fn is_safe_to_clear(path: &Path) -> bool {
        let path_str = path.to_string_lossy();

        if matches!(path_str.as_ref(), "/" | "/home" | "/usr" | "/etc" | "/var" | "/opt") {
            return false;
        }

        if let Some(home) = dirs::home_dir() {
            if path == home {
                return false;
            }
        }

        let depth = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count();

        depth >= 2
    }
}
