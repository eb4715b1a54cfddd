//! Elevation Coordinator
//!
//! Chooses between running the updater directly and handing the attempt to
//! the privileged update service, and owns everything the service path
//! needs: the one-time installer upgrade and signature gate, the stop
//! barriers around an attempt, and the service log diff afterwards.

use crate::error::{Result, UpdateError};
use crate::paths::service;
use crate::poll::{Poller, Step};
use crate::polkit::PrivilegeAuthority;
use crate::process::{Invocation, ProcessProbe, ProcessRunner};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// How an attempt reaches the updater
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    /// Spawn the updater ourselves
    Direct,

    /// Hand the attempt to the privileged service
    Service,
}

/// Service log contents captured before an attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceLogSnapshot {
    pub contents: String,
}

/// Where the service pieces live and how to start an attempt through them
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Directory holding the service, temporary service and installer
    pub bin_dir: PathBuf,

    /// Program and leading arguments that hand an attempt to the service
    pub launch_command: Vec<OsString>,

    pub log_path: PathBuf,

    /// Base64 Ed25519 key the service and updater must be signed with
    pub trusted_public_key: Option<String>,

    /// Run the installer once before the first attempt when authorized
    pub upgrade_installer: bool,

    /// Budget for the stop barriers
    pub barrier: Poller,
}

impl ServiceSettings {
    pub fn new(bin_dir: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        let bin_dir = bin_dir.into();
        Self {
            launch_command: vec![bin_dir.join(service::SERVICE_BIN).into_os_string()],
            bin_dir,
            log_path: log_path.into(),
            trusted_public_key: None,
            upgrade_installer: false,
            barrier: Poller::iterations(Duration::from_secs(1), 120),
        }
    }

    pub fn service_binary(&self) -> PathBuf {
        self.bin_dir.join(service::SERVICE_BIN)
    }

    pub fn installer(&self) -> PathBuf {
        self.bin_dir.join(service::INSTALLER_BIN)
    }
}

/// Helper processes that must be gone before and after an attempt
pub const HELPER_PROCESSES: [&str; 3] = [
    service::INSTALLER_BIN,
    service::TEMP_SERVICE_BIN,
    service::SERVICE_BIN,
];

pub struct ElevationCoordinator {
    settings: ServiceSettings,
    runner: Arc<dyn ProcessRunner>,
    probe: Arc<dyn ProcessProbe>,
    authority: Arc<dyn PrivilegeAuthority>,
    gate: OnceCell<ExecutionPath>,
}

impl ElevationCoordinator {
    pub fn new(
        settings: ServiceSettings,
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn ProcessProbe>,
        authority: Arc<dyn PrivilegeAuthority>,
    ) -> Self {
        Self {
            settings,
            runner,
            probe,
            authority,
            gate: OnceCell::new(),
        }
    }

    /// Decide the path for an attempt. The service gate runs once; later
    /// attempts reuse its answer.
    pub async fn select_path(&self, use_service: bool, updater: &Path) -> Result<ExecutionPath> {
        if !use_service {
            return Ok(ExecutionPath::Direct);
        }

        self.gate
            .get_or_try_init(|| self.run_gate(updater))
            .await
            .copied()
    }

    async fn run_gate(&self, updater: &Path) -> Result<ExecutionPath> {
        if self.settings.upgrade_installer {
            self.upgrade_installer().await;
        }

        let service_binary = self.settings.service_binary();
        if !service_binary.is_file() {
            tracing::warn!(
                "Service binary {} not found, running the updater directly",
                service_binary.display()
            );
            return Ok(ExecutionPath::Direct);
        }

        self.check_signatures(&[service_binary.as_path(), updater])?;
        Ok(ExecutionPath::Service)
    }

    /// Best-effort installer run; every failure is only a warning
    async fn upgrade_installer(&self) {
        if self.authority.is_elevated() {
            tracing::debug!("Already elevated, skipping service installer upgrade");
            return;
        }

        if !self.authority.can_install_service().await {
            tracing::debug!("Not authorized to upgrade the service installer");
            return;
        }

        let installer = self.settings.installer();
        let invocation = Invocation::new(&installer).current_dir(&self.settings.bin_dir);

        match self.runner.run(&invocation).await {
            Ok(0) => tracing::info!("Service installer upgrade finished"),
            Ok(code) => tracing::warn!("Service installer exited with code {}", code),
            Err(e) => tracing::warn!("Could not run service installer: {}", e),
        }
    }

    #[cfg(not(feature = "no-signature-check"))]
    fn check_signatures(&self, binaries: &[&Path]) -> Result<()> {
        let key = self
            .settings
            .trusted_public_key
            .as_deref()
            .ok_or_else(|| UpdateError::Signature {
                path: self.settings.service_binary(),
                reason: "no trusted public key configured".to_string(),
            })?;

        for binary in binaries {
            crate::signing::verify_file(binary, key)?;
        }
        Ok(())
    }

    #[cfg(feature = "no-signature-check")]
    fn check_signatures(&self, _binaries: &[&Path]) -> Result<()> {
        tracing::warn!("Signature checks disabled at build time");
        Ok(())
    }

    /// Wait for every helper process to exit before an attempt
    pub async fn wait_for_helpers_stopped(&self) -> Result<()> {
        self.settings
            .barrier
            .run("service helpers to stop", |_| {
                let running = self.probe.running(&HELPER_PROCESSES);
                if running.is_empty() {
                    Step::Done(())
                } else {
                    tracing::debug!("Still running: {}", running.join(", "));
                    Step::Wait
                }
            })
            .await
    }

    /// Same barrier after an attempt, where running out of budget is only
    /// logged
    pub async fn settle_after_attempt(&self) {
        if let Err(e) = self.wait_for_helpers_stopped().await {
            tracing::warn!("{}", e);
        }
    }

    /// Capture the service log; a missing log reads as empty
    pub fn snapshot_log(&self) -> Result<ServiceLogSnapshot> {
        Ok(ServiceLogSnapshot {
            contents: read_log(&self.settings.log_path)?,
        })
    }

    /// The log must have changed since `before` and carry the launch marker
    pub fn check_log(&self, before: &ServiceLogSnapshot) -> Result<()> {
        let after = read_log(&self.settings.log_path)?;

        if after == before.contents {
            return Err(UpdateError::ServiceLog(format!(
                "{} did not change during the attempt",
                self.settings.log_path.display()
            )));
        }

        if !after.contains(service::SUCCESSFUL_LAUNCH_MARKER) {
            return Err(UpdateError::ServiceLog(format!(
                "{} is missing {:?}",
                self.settings.log_path.display(),
                service::SUCCESSFUL_LAUNCH_MARKER
            )));
        }

        Ok(())
    }

    /// Copy the updater, service and installer into the apply directory
    pub fn stage_binaries(&self, updater: &Path, apply_dir: &Path) -> Result<()> {
        let sources = [
            updater.to_path_buf(),
            self.settings.service_binary(),
            self.settings.installer(),
        ];

        for source in sources.iter().filter(|p| p.is_file()) {
            let Some(name) = source.file_name() else {
                continue;
            };
            let dest = apply_dir.join(name);
            if dest == *source {
                continue;
            }
            std::fs::copy(source, &dest).map_err(|e| UpdateError::io(&dest, e))?;
            tracing::debug!("Staged {} into {}", source.display(), apply_dir.display());
        }

        Ok(())
    }

    /// Launch command followed by the updater path and its arguments
    pub fn launch_invocation(
        &self,
        updater: &Path,
        updater_args: &[OsString],
    ) -> Result<Invocation> {
        let Some((program, args)) = self.settings.launch_command.split_first() else {
            return Err(UpdateError::ProcessLaunch {
                program: self.settings.service_binary(),
                source: std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "empty service launch command",
                ),
            });
        };

        Ok(Invocation::new(program)
            .args(args.iter().cloned())
            .arg(updater.as_os_str())
            .args(updater_args.iter().cloned()))
    }

    /// Start the attempt through the service. Returns once the launcher
    /// exits; the update itself continues in the service.
    pub async fn launch(&self, invocation: &Invocation) -> Result<i32> {
        let code = self.runner.run(invocation).await?;
        tracing::info!("Service launch command exited with code {}", code);
        Ok(code)
    }
}

fn read_log(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(UpdateError::io(path, e)),
    }
}
