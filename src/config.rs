//! Upstage Configuration Parser
//!
//! Parses upstage.toml, the declarative description of one update attempt:
//! where the trees live, which updater and service binaries to drive, what
//! the attempt should end in and how long each wait may take.

use crate::orchestrator::UpdateMode;
use crate::paths::{artifacts, service};
use crate::status::UpdateStatus;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the current directory
pub const CONFIG_FILE: &str = "upstage.toml";

/// The main configuration structure matching upstage.toml
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub attempt: AttemptConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
}

/// Locations, all relative to the config file's directory unless absolute
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding update.status, update.version and the archive
    pub updates_dir: PathBuf,

    /// Installation tree the update is applied to
    pub apply_dir: PathBuf,

    /// Patch archive, staged as update.mar
    pub archive: PathBuf,

    /// External updater binary
    pub updater: PathBuf,

    /// Directory `compare_file` manifest entries and reference logs live in
    #[serde(default = "default_reference_dir")]
    pub reference_dir: PathBuf,

    /// Exported as LD_LIBRARY_PATH for the attempt (optional)
    #[serde(default)]
    pub library_dir: Option<PathBuf>,

    /// Exported as the update-root override (optional)
    #[serde(default)]
    pub update_root: Option<PathBuf>,
}

/// What to run and what it should end in
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptConfig {
    #[serde(default)]
    pub mode: UpdateMode,

    /// Route through the privileged service
    #[serde(default)]
    pub use_service: bool,

    /// Status seeded before launch (default: pending, or pending-service)
    #[serde(default)]
    pub seed_status: Option<String>,

    /// Terminal status the attempt must reach
    #[serde(default = "default_expected_status")]
    pub expected_status: String,

    /// Version token written before launch
    #[serde(default = "default_version")]
    pub version: String,

    /// Exit code the updater must return (default: 0 when success is expected)
    #[serde(default)]
    pub expected_exit_code: Option<i32>,

    /// Working directory handed to the updater (and the callback)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Replacement updater-settings.ini contents for the attempt
    #[serde(default)]
    pub settings_ini: Option<String>,

    #[serde(default = "default_true")]
    pub no_hash_dir: bool,

    #[serde(default = "default_true")]
    pub no_service_fallback: bool,

    #[serde(default)]
    pub no_replace_fallback: bool,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            mode: UpdateMode::default(),
            use_service: false,
            seed_status: None,
            expected_status: default_expected_status(),
            version: default_version(),
            expected_exit_code: None,
            working_dir: None,
            settings_ini: None,
            no_hash_dir: true,
            no_service_fallback: true,
            no_replace_fallback: false,
        }
    }
}

/// Callback application relaunched after the update
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Callback executable (optional when disabled)
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Arguments passed to the callback, also what its log must contain
    #[serde(default)]
    pub args: Vec<String>,

    /// Log the callback writes its arguments to
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// Launch the callback ourselves instead of leaving it to the updater
    #[serde(default)]
    pub launch_directly: bool,

    #[serde(default = "default_stable_polls")]
    pub stable_polls: u32,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: None,
            args: Vec::new(),
            log: None,
            launch_directly: false,
            stable_polls: default_stable_polls(),
        }
    }
}

/// Privileged update service
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    /// Directory holding the service, temporary service and installer binaries
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// Command that hands the attempt to the service; updater arguments
    /// are appended after the updater path
    #[serde(default)]
    pub launch_command: Vec<String>,

    /// Service log (default: ~/.local/share/upstage/logs/service.log)
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// Base64 Ed25519 public key the service and updater binaries are signed with
    #[serde(default)]
    pub trusted_public_key: Option<String>,

    /// Run the service installer before the first attempt when authorized
    #[serde(default)]
    pub upgrade_installer: bool,
}

/// Poll budgets, in milliseconds
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,

    /// How long pending-service may persist before it counts as terminal
    #[serde(default = "default_pending_service_grace")]
    pub pending_service_grace_ms: u64,

    #[serde(default = "default_poll_interval")]
    pub barrier_interval_ms: u64,

    #[serde(default = "default_barrier_iterations")]
    pub barrier_iterations: u32,

    #[serde(default = "default_callback_interval")]
    pub callback_interval_ms: u64,

    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            status_timeout_ms: default_status_timeout(),
            pending_service_grace_ms: default_pending_service_grace(),
            barrier_interval_ms: default_poll_interval(),
            barrier_iterations: default_barrier_iterations(),
            callback_interval_ms: default_callback_interval(),
            callback_timeout_ms: default_callback_timeout(),
        }
    }
}

impl TimeoutsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn pending_service_grace(&self) -> Duration {
        Duration::from_millis(self.pending_service_grace_ms)
    }

    pub fn barrier_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_interval_ms)
    }

    pub fn callback_interval(&self) -> Duration {
        Duration::from_millis(self.callback_interval_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

/// Post-attempt checks
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Directory manifests are resolved against; defaults to where the
    /// mode leaves the result (`updated/` for background attempts)
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// JSON manifest checked when the attempt is expected to succeed
    #[serde(default)]
    pub success_manifest: Option<PathBuf>,

    /// JSON manifest checked when the attempt is expected to fail
    #[serde(default)]
    pub failure_manifest: Option<PathBuf>,

    /// Extensions that must not survive anywhere in the trees
    #[serde(default = "artifacts::default_reserved")]
    pub reserved_extensions: Vec<String>,

    /// Reference update.log, compared after normalization
    #[serde(default)]
    pub reference_log: Option<PathBuf>,

    /// Text update.log must contain
    #[serde(default)]
    pub log_contains: Option<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            root: None,
            success_manifest: None,
            failure_manifest: None,
            reserved_extensions: artifacts::default_reserved(),
            reference_log: None,
            log_contains: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_reference_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_expected_status() -> String {
    "succeeded".to_string()
}

fn default_version() -> String {
    "99.0".to_string()
}

fn default_stable_polls() -> u32 {
    crate::callback::DEFAULT_STABLE_POLLS
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_status_timeout() -> u64 {
    300_000
}

fn default_pending_service_grace() -> u64 {
    10_000
}

fn default_barrier_iterations() -> u32 {
    120
}

fn default_callback_interval() -> u64 {
    100
}

fn default_callback_timeout() -> u64 {
    60_000
}

impl Config {
    /// Load configuration from a file path; relative paths resolve against
    /// the file's directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_str(&contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(config.resolve(base_dir))
    }

    /// Load configuration from the current directory
    pub fn from_current_dir() -> Result<Self> {
        let config_path = std::env::current_dir()?.join(CONFIG_FILE);

        if !config_path.exists() {
            anyhow::bail!(
                "No {} found in current directory.\n\
                 Run 'upstage init' to create one, or specify a path with --config",
                CONFIG_FILE
            );
        }

        Self::from_file(&config_path)
    }

    /// Parse configuration from a TOML string (paths left as written)
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).with_context(|| format!("Failed to parse {}", CONFIG_FILE))
    }

    /// Make every relative path absolute against `base_dir`
    pub fn resolve(mut self, base_dir: &Path) -> Self {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };

        join(&mut self.paths.updates_dir);
        join(&mut self.paths.apply_dir);
        join(&mut self.paths.archive);
        join(&mut self.paths.updater);
        join(&mut self.paths.reference_dir);

        let optional = [
            &mut self.paths.library_dir,
            &mut self.paths.update_root,
            &mut self.attempt.working_dir,
            &mut self.callback.program,
            &mut self.callback.log,
            &mut self.service.bin_dir,
            &mut self.service.log,
            &mut self.verify.root,
            &mut self.verify.success_manifest,
            &mut self.verify.failure_manifest,
        ];
        for path in optional.into_iter().flatten() {
            join(path);
        }

        // Relative reference logs live in the reference directory
        if let Some(ref mut log) = self.verify.reference_log {
            if log.is_relative() {
                *log = self.paths.reference_dir.join(&*log);
            }
        }

        self
    }

    pub fn expected_status(&self) -> Result<UpdateStatus> {
        UpdateStatus::parse(&self.attempt.expected_status)
            .with_context(|| format!("Invalid expected_status: {}", self.attempt.expected_status))
    }

    pub fn seed_status(&self) -> Result<UpdateStatus> {
        match self.attempt.seed_status {
            Some(ref token) => UpdateStatus::parse(token)
                .with_context(|| format!("Invalid seed_status: {}", token)),
            None if self.attempt.use_service => Ok(UpdateStatus::PendingService),
            None => Ok(UpdateStatus::Pending),
        }
    }

    /// Service log location, falling back to the per-user default
    pub fn service_log_path(&self) -> Option<PathBuf> {
        self.service.log.clone().or_else(service::default_log_path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.expected_status()?;
        self.seed_status()?;

        if !self.paths.updater.is_file() {
            anyhow::bail!("Updater binary does not exist: {}", self.paths.updater.display());
        }

        if !self.paths.archive.is_file() {
            anyhow::bail!("Patch archive does not exist: {}", self.paths.archive.display());
        }

        if !self.paths.apply_dir.is_dir() {
            anyhow::bail!(
                "Apply directory does not exist: {}\n\
                 Create and populate it with the installation to update.",
                self.paths.apply_dir.display()
            );
        }

        if self.timeouts.poll_interval_ms == 0 || self.timeouts.barrier_interval_ms == 0 {
            anyhow::bail!("Poll intervals must be greater than zero");
        }

        if self.timeouts.barrier_iterations == 0 {
            anyhow::bail!("barrier_iterations must be at least 1");
        }

        if self.callback.enabled {
            if self.callback.log.is_none() {
                anyhow::bail!("[callback] is enabled but no log path is set");
            }
            if self.callback.program.is_none() {
                anyhow::bail!("[callback] is enabled but no program is set");
            }
        }

        if self.attempt.use_service {
            if self.service.bin_dir.is_none() {
                anyhow::bail!("use_service is set but [service] bin_dir is missing");
            }
            if self.service.launch_command.is_empty() {
                anyhow::bail!("use_service is set but [service] launch_command is empty");
            }
            if self.service.trusted_public_key.is_none() && !cfg!(feature = "no-signature-check") {
                anyhow::bail!(
                    "use_service is set but [service] trusted_public_key is missing.\n\
                     Generate one with 'upstage key generate'."
                );
            }
        }

        if self.verify.reference_log.is_some() && self.verify.log_contains.is_some() {
            anyhow::bail!("Set either reference_log or log_contains in [verify], not both");
        }

        Ok(())
    }
}

/// Generate a template upstage.toml file
pub fn generate_template(updater: &str) -> String {
    format!(
        r#"# Upstage Update Attempt Configuration

[paths]
updates_dir = "./run/updates"
apply_dir = "./run/app"
archive = "./data/complete.mar"
updater = "{updater}"
reference_dir = "./data"
# library_dir = "./run/app"
# update_root = "./run"

[attempt]
# foreground, background or switch
mode = "foreground"
use_service = false
expected_status = "succeeded"
version = "99.0"
# expected_exit_code = 0
# working_dir = "./run/app"
# settings_ini = "[Settings]\nACCEPTED_MAR_CHANNEL_IDS=test-channel\n"

[callback]
enabled = false
# program = "./bin/upstage-callback-stub"
# args = ["./run/app", "callback.log", "Test Arg 2", "Test Arg 3"]
# log = "./run/app/callback.log"
# stable_polls = 3

[service]
# bin_dir = "./bin"
# launch_command = ["./bin/upstage-service", "software-update"]
# trusted_public_key = "<base64 public key>"
# upgrade_installer = false

[timeouts]
poll_interval_ms = 1000
status_timeout_ms = 300000
pending_service_grace_ms = 10000
barrier_iterations = 120

[verify]
# root = "./run/app"
# success_manifest = "./data/success.json"
# failure_manifest = "./data/failure.json"
reserved_extensions = ["patch", "backup"]
# reference_log = "update_success.log"
"#,
        updater = updater,
    )
}
