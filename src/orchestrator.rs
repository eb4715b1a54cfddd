//! Update Orchestrator
//!
//! Drives one update attempt end to end:
//! 1. Pick the direct or service path (and clear the stop barrier)
//! 2. Stage the updater and archive, swap in the attempt's settings file
//! 3. Seed the status and version files
//! 4. Launch with the attempt environment applied
//! 5. Poll the status file until it is terminal
//! 6. Restore, then verify: status, service log, exit code, tree, update
//!    log and callback
//!
//! The completion sink hears about the attempt exactly once.

use crate::callback::CallbackCheck;
use crate::config::Config;
use crate::elevation::{ElevationCoordinator, ExecutionPath};
use crate::environment::{AttemptEnvironment, EnvOverrides, EnvStore, ProcessEnv};
use crate::error::{Result, UpdateError};
use crate::manifest::TreeManifest;
use crate::paths::{artifacts, files, safety};
use crate::poll::{Poller, Step};
use crate::process::{Invocation, ProcessRunner};
use crate::status::{StatusStore, UpdateStatus};
use crate::update_log::{self, UpdateLogExpectation};
use crate::verify::TreeVerifier;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;

/// Identical reads of an unrecognized status token before giving up
const UNKNOWN_STATUS_READS: u32 = 3;

/// How the updater applies the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Apply in place and relaunch the callback
    #[default]
    Foreground,

    /// Stage into `updated/` without a callback
    Background,

    /// Stage into `updated/`, then replace the installation
    Switch,
}

impl UpdateMode {
    /// Mode argument the updater expects
    pub fn arg(&self) -> &'static str {
        match self {
            UpdateMode::Foreground => "0",
            UpdateMode::Background => "-1",
            UpdateMode::Switch => "0/replace",
        }
    }

    /// Directory the updater writes into
    pub fn target_dir(&self, apply_dir: &Path) -> PathBuf {
        match self {
            UpdateMode::Foreground => apply_dir.to_path_buf(),
            UpdateMode::Background | UpdateMode::Switch => files::updated_dir(apply_dir),
        }
    }

    pub fn passes_callback(&self) -> bool {
        !matches!(self, UpdateMode::Background)
    }

    /// Directory holding the result once the attempt is over. A switch has
    /// already moved `updated/` into place by then.
    pub fn result_dir(&self, apply_dir: &Path) -> PathBuf {
        match self {
            UpdateMode::Background => files::updated_dir(apply_dir),
            UpdateMode::Foreground | UpdateMode::Switch => apply_dir.to_path_buf(),
        }
    }
}

/// Callback relaunch for a successful attempt
#[derive(Debug, Clone)]
pub struct CallbackPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log: PathBuf,

    /// Launch the callback ourselves instead of leaving it to the updater
    pub launch_directly: bool,

    pub stable_polls: u32,
    pub poller: Poller,
}

/// Everything one attempt needs, with paths resolved
#[derive(Debug, Clone)]
pub struct AttemptPlan {
    pub updates_dir: PathBuf,
    pub apply_dir: PathBuf,
    pub archive: PathBuf,
    pub updater: PathBuf,
    pub reference_dir: PathBuf,

    pub mode: UpdateMode,
    pub use_service: bool,
    pub seed_status: UpdateStatus,
    pub expected_status: UpdateStatus,
    pub version: String,
    pub expected_exit_code: Option<i32>,
    pub working_dir: Option<PathBuf>,
    pub settings_ini: Option<String>,
    pub env: EnvOverrides,
    pub callback: Option<CallbackPlan>,

    pub success_manifest: TreeManifest,
    pub failure_manifest: TreeManifest,
    /// Overrides the mode's result directory as the manifest root
    pub verify_root: Option<PathBuf>,
    pub reserved_extensions: Vec<String>,
    pub update_log: Option<UpdateLogExpectation>,

    pub status_poller: Poller,
    pub pending_service_grace: Duration,
}

impl AttemptPlan {
    /// A foreground attempt expected to succeed, with default budgets
    pub fn new(
        updates_dir: impl Into<PathBuf>,
        apply_dir: impl Into<PathBuf>,
        archive: impl Into<PathBuf>,
        updater: impl Into<PathBuf>,
    ) -> Self {
        let updates_dir = updates_dir.into();
        let apply_dir = apply_dir.into();

        Self {
            env: EnvOverrides {
                app_dir: Some(apply_dir.clone()),
                no_hash_dir: true,
                no_service_fallback: true,
                ..EnvOverrides::default()
            },
            reference_dir: apply_dir.clone(),
            updates_dir,
            apply_dir,
            archive: archive.into(),
            updater: updater.into(),
            mode: UpdateMode::Foreground,
            use_service: false,
            seed_status: UpdateStatus::Pending,
            expected_status: UpdateStatus::Succeeded,
            version: "99.0".to_string(),
            expected_exit_code: None,
            working_dir: None,
            settings_ini: None,
            callback: None,
            success_manifest: TreeManifest::new(),
            failure_manifest: TreeManifest::new(),
            verify_root: None,
            reserved_extensions: artifacts::default_reserved(),
            update_log: None,
            status_poller: Poller::new(Duration::from_secs(1), Duration::from_secs(300)),
            pending_service_grace: Duration::from_secs(10),
        }
    }

    /// Build a plan from a resolved configuration, loading its manifests
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let paths = &config.paths;
        let attempt = &config.attempt;
        let timeouts = &config.timeouts;

        let mut plan = Self::new(
            &paths.updates_dir,
            &paths.apply_dir,
            &paths.archive,
            &paths.updater,
        );

        plan.reference_dir = paths.reference_dir.clone();
        plan.mode = attempt.mode;
        plan.use_service = attempt.use_service;
        plan.seed_status = config.seed_status()?;
        plan.expected_status = config.expected_status()?;
        plan.version = attempt.version.clone();
        plan.expected_exit_code = attempt.expected_exit_code;
        plan.working_dir = attempt.working_dir.clone();
        plan.settings_ini = attempt.settings_ini.clone();

        plan.env = EnvOverrides {
            update_root: paths.update_root.clone(),
            app_dir: Some(paths.apply_dir.clone()),
            no_hash_dir: attempt.no_hash_dir,
            background: attempt.mode == UpdateMode::Background,
            no_service_fallback: attempt.no_service_fallback,
            no_replace_fallback: attempt.no_replace_fallback,
            library_dir: paths.library_dir.clone(),
        };

        if config.callback.enabled {
            let callback = &config.callback;
            plan.callback = Some(CallbackPlan {
                program: callback
                    .program
                    .clone()
                    .context("[callback] is enabled but no program is set")?,
                args: callback.args.clone(),
                log: callback
                    .log
                    .clone()
                    .context("[callback] is enabled but no log path is set")?,
                launch_directly: callback.launch_directly,
                stable_polls: callback.stable_polls,
                poller: Poller::new(timeouts.callback_interval(), timeouts.callback_timeout()),
            });
        }

        if let Some(ref path) = config.verify.success_manifest {
            plan.success_manifest = TreeManifest::load(path).await?;
        }
        if let Some(ref path) = config.verify.failure_manifest {
            plan.failure_manifest = TreeManifest::load(path).await?;
        }
        plan.verify_root = config.verify.root.clone();
        plan.reserved_extensions = config.verify.reserved_extensions.clone();

        plan.update_log = match (&config.verify.reference_log, &config.verify.log_contains) {
            (Some(reference), _) => Some(UpdateLogExpectation::Reference(reference.clone())),
            (None, Some(needle)) => Some(UpdateLogExpectation::Contains(needle.clone())),
            (None, None) => None,
        };

        plan.status_poller = Poller::new(timeouts.poll_interval(), timeouts.status_timeout());
        plan.pending_service_grace = timeouts.pending_service_grace();

        Ok(plan)
    }

    /// Whether the attempt should end in a non-failure status
    pub fn expects_success(&self) -> bool {
        !self.expected_status.is_failure()
    }

    /// `[updates_dir, target_dir, mode, cwd?, callback_path?, callback_args...]`
    pub fn updater_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.updates_dir.clone().into(),
            self.mode.target_dir(&self.apply_dir).into(),
            self.mode.arg().into(),
        ];

        if !self.mode.passes_callback() {
            return args;
        }

        let callback = self.callback.as_ref().filter(|c| !c.launch_directly);
        if self.working_dir.is_some() || callback.is_some() {
            args.push(self.updater_cwd().into());
        }
        if let Some(callback) = callback {
            args.push(callback.program.clone().into());
            args.extend(callback.args.iter().map(OsString::from));
        }

        args
    }

    /// Root the manifests are checked against
    pub fn manifest_root(&self) -> PathBuf {
        match self.verify_root {
            Some(ref root) => root.clone(),
            None => self.mode.result_dir(&self.apply_dir),
        }
    }

    /// The callback to wait for. A background updater is never told about
    /// one, so only a callback we launch ourselves counts there.
    fn checked_callback(&self) -> Option<&CallbackPlan> {
        self.callback
            .as_ref()
            .filter(|c| c.launch_directly || self.mode.passes_callback())
    }

    fn updater_cwd(&self) -> PathBuf {
        self.working_dir.clone().unwrap_or_else(|| self.apply_dir.clone())
    }

    fn staged_updater(&self, dir: &Path) -> PathBuf {
        match self.updater.file_name() {
            Some(name) => dir.join(name),
            None => self.updater.clone(),
        }
    }
}

/// What a finished attempt looked like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSummary {
    pub path: ExecutionPath,
    pub final_status: UpdateStatus,
    pub exit_code: i32,
    pub elapsed: Duration,
}

/// Either a definitive success or every problem found
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(AttemptSummary),
    Failure(Vec<UpdateError>),
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success(_))
    }

    pub fn problems(&self) -> &[UpdateError] {
        match self {
            AttemptOutcome::Success(_) => &[],
            AttemptOutcome::Failure(problems) => problems,
        }
    }
}

/// Receives progress and the final outcome of an attempt
pub trait NotificationSink: Send + Sync {
    /// Called whenever the polled status changes
    fn on_status(&self, _status: &UpdateStatus) {}

    /// Called exactly once per attempt
    fn on_complete(&self, outcome: &AttemptOutcome);
}

/// Logs progress and the outcome through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_status(&self, status: &UpdateStatus) {
        tracing::info!("Update status: {}", status);
    }

    fn on_complete(&self, outcome: &AttemptOutcome) {
        match outcome {
            AttemptOutcome::Success(summary) => tracing::info!(
                "Update attempt succeeded: {} via {:?} in {:?}",
                summary.final_status,
                summary.path,
                summary.elapsed
            ),
            AttemptOutcome::Failure(problems) => {
                tracing::warn!("Update attempt failed with {} problem(s)", problems.len());
                for problem in problems {
                    tracing::warn!("  [{}] {}", problem.kind(), problem);
                }
            }
        }
    }
}

/// Restores updater-settings.ini when dropped
struct SettingsGuard {
    ini: PathBuf,
    backup: PathBuf,
    active: bool,
}

impl SettingsGuard {
    fn apply(apply_dir: &Path, contents: Option<&str>) -> Result<Self> {
        let ini = apply_dir.join(files::SETTINGS_INI);
        let backup = apply_dir.join(files::SETTINGS_INI_BAK);

        let Some(contents) = contents else {
            return Ok(Self {
                ini,
                backup,
                active: false,
            });
        };

        if ini.exists() {
            std::fs::rename(&ini, &backup).map_err(|e| UpdateError::io(&backup, e))?;
        }
        let guard = Self {
            ini,
            backup,
            active: true,
        };
        std::fs::write(&guard.ini, contents).map_err(|e| UpdateError::io(&guard.ini, e))?;
        Ok(guard)
    }

    fn restore(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.active) {
            return Ok(());
        }

        if self.ini.exists() {
            std::fs::remove_file(&self.ini).map_err(|e| UpdateError::io(&self.ini, e))?;
        }
        if self.backup.exists() {
            std::fs::rename(&self.backup, &self.ini).map_err(|e| UpdateError::io(&self.ini, e))?;
        }
        Ok(())
    }
}

impl Drop for SettingsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::warn!("Failed to restore {}: {}", files::SETTINGS_INI, e);
        }
    }
}

pub struct UpdateOrchestrator {
    runner: Arc<dyn ProcessRunner>,
    env_store: Arc<dyn EnvStore>,
    sink: Arc<dyn NotificationSink>,
    elevation: Option<ElevationCoordinator>,
}

impl UpdateOrchestrator {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            env_store: Arc::new(ProcessEnv),
            sink: Arc::new(TracingSink),
            elevation: None,
        }
    }

    pub fn with_env_store(mut self, env_store: Arc<dyn EnvStore>) -> Self {
        self.env_store = env_store;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_elevation(mut self, elevation: ElevationCoordinator) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Run one attempt and report it to the sink
    pub async fn run(&self, plan: &AttemptPlan) -> AttemptOutcome {
        let outcome = match self.attempt(plan).await {
            Ok((summary, problems)) if problems.is_empty() => AttemptOutcome::Success(summary),
            Ok((_, problems)) => AttemptOutcome::Failure(problems),
            Err(fatal) => {
                tracing::error!("Update attempt aborted: {}", fatal);
                AttemptOutcome::Failure(vec![fatal])
            }
        };

        self.sink.on_complete(&outcome);
        outcome
    }

    /// Errors returned here abort the attempt; everything found after a
    /// terminal status lands in the problem list instead
    async fn attempt(&self, plan: &AttemptPlan) -> Result<(AttemptSummary, Vec<UpdateError>)> {
        let started = Instant::now();
        let path = self.select_path(plan).await?;
        let coordinator = match path {
            ExecutionPath::Service => self.elevation.as_ref(),
            ExecutionPath::Direct => None,
        };
        tracing::info!("Applying update via {:?} path ({:?} mode)", path, plan.mode);

        let snapshot = match coordinator {
            Some(coordinator) => {
                coordinator.wait_for_helpers_stopped().await?;
                Some(coordinator.snapshot_log()?)
            }
            None => None,
        };

        self.stage(plan).await?;
        if let Some(coordinator) = coordinator {
            coordinator.stage_binaries(&plan.updater, &plan.apply_dir)?;
        }

        let mut settings = SettingsGuard::apply(&plan.apply_dir, plan.settings_ini.as_deref())?;

        let store = StatusStore::new(&plan.updates_dir);
        store.write_status(&plan.seed_status)?;
        store.write_version(&plan.version)?;

        let environment = AttemptEnvironment::new(self.env_store.clone(), plan.env.clone());
        let (exit_code, final_status) = {
            let guard = environment.acquire();
            let exit_code = self.launch(plan, coordinator, guard.applied()).await?;
            let final_status = self.poll_status(&store, plan).await?;
            (exit_code, final_status)
        };

        let mut problems = Vec::new();

        if let Some(coordinator) = coordinator {
            coordinator.settle_after_attempt().await;
        }

        if let Err(e) = settings.restore() {
            problems.push(e);
        }

        if !final_status.satisfies(&plan.expected_status) {
            problems.push(UpdateError::StateMismatch {
                expected: plan.expected_status.clone(),
                observed: final_status.clone(),
            });
        }

        if let (Some(coordinator), Some(snapshot)) = (coordinator, snapshot.as_ref()) {
            if let Err(e) = coordinator.check_log(snapshot) {
                problems.push(e);
            }
        }

        let expected_exit = plan
            .expected_exit_code
            .or_else(|| plan.expects_success().then_some(0));
        if let Some(expected) = expected_exit {
            if exit_code != expected {
                problems.push(UpdateError::ProcessExit {
                    program: plan.updater.clone(),
                    code: exit_code,
                });
            }
        }

        let mismatches = self.verify_tree(plan);
        if !mismatches.is_empty() {
            problems.push(UpdateError::Verification(mismatches));
        }

        if let Some(ref expectation) = plan.update_log {
            if let Err(e) = update_log::check(&plan.updates_dir, plan.mode, expectation) {
                problems.push(e);
            }
        }

        if plan.expects_success() && problems.is_empty() {
            if let Some(callback) = plan.checked_callback() {
                if let Err(e) = self.check_callback(plan, callback).await {
                    problems.push(e);
                }
            }
        }

        let summary = AttemptSummary {
            path,
            final_status,
            exit_code,
            elapsed: started.elapsed(),
        };
        Ok((summary, problems))
    }

    async fn select_path(&self, plan: &AttemptPlan) -> Result<ExecutionPath> {
        match (plan.use_service, &self.elevation) {
            (false, _) => Ok(ExecutionPath::Direct),
            (true, Some(coordinator)) => coordinator.select_path(true, &plan.updater).await,
            (true, None) => {
                tracing::warn!(
                    "Service path requested but no service is configured, running directly"
                );
                Ok(ExecutionPath::Direct)
            }
        }
    }

    /// Fresh updates directory holding the updater and `update.mar`
    async fn stage(&self, plan: &AttemptPlan) -> Result<()> {
        let updates_dir = &plan.updates_dir;

        if updates_dir.exists() {
            if !safety::is_safe_to_clear(updates_dir) {
                return Err(UpdateError::io(
                    updates_dir,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "refusing to clear this directory",
                    ),
                ));
            }
            fs::remove_dir_all(updates_dir)
                .await
                .map_err(|e| UpdateError::io(updates_dir, e))?;
        }

        fs::create_dir_all(updates_dir)
            .await
            .map_err(|e| UpdateError::io(updates_dir, e))?;

        let staged_updater = plan.staged_updater(updates_dir);
        fs::copy(&plan.updater, &staged_updater)
            .await
            .map_err(|e| UpdateError::io(&plan.updater, e))?;

        let archive = files::archive_file(updates_dir);
        fs::copy(&plan.archive, &archive)
            .await
            .map_err(|e| UpdateError::io(&plan.archive, e))?;

        tracing::debug!("Staged updater and archive into {}", updates_dir.display());
        Ok(())
    }

    async fn launch(
        &self,
        plan: &AttemptPlan,
        coordinator: Option<&ElevationCoordinator>,
        env: std::collections::BTreeMap<String, Option<String>>,
    ) -> Result<i32> {
        let args = plan.updater_args();

        match coordinator {
            Some(coordinator) => {
                let updater = plan.staged_updater(&plan.apply_dir);
                let invocation = coordinator
                    .launch_invocation(&updater, &args)?
                    .envs(env)
                    .current_dir(plan.updater_cwd());
                coordinator.launch(&invocation).await
            }
            None => {
                let invocation = Invocation::new(plan.staged_updater(&plan.updates_dir))
                    .args(args)
                    .envs(env)
                    .current_dir(plan.updater_cwd());
                self.runner.run(&invocation).await
            }
        }
    }

    /// Poll until terminal; `pending-service` ends polling once the grace
    /// period is over
    async fn poll_status(&self, store: &StatusStore, plan: &AttemptPlan) -> Result<UpdateStatus> {
        let started = Instant::now();
        let mut last: Option<UpdateStatus> = None;
        let mut unknown: Option<(String, u32)> = None;

        plan.status_poller
            .run("terminal update status", |_| {
                // The updater rewrites the file in place, so a read can land
                // between truncate and write
                let token = match store.read_status_token() {
                    Ok(token) => token,
                    Err(UpdateError::Io { ref source, .. })
                        if source.kind() == std::io::ErrorKind::NotFound =>
                    {
                        return Step::Wait;
                    }
                    Err(e) => return Step::Fail(e),
                };
                if token.is_empty() {
                    return Step::Wait;
                }

                let status = match UpdateStatus::parse(&token) {
                    Ok(status) => {
                        unknown = None;
                        status
                    }
                    Err(e) => {
                        let reads = match unknown {
                            Some((ref seen, reads)) if *seen == token => reads + 1,
                            _ => 1,
                        };
                        if reads >= UNKNOWN_STATUS_READS {
                            return Step::Fail(e);
                        }
                        tracing::debug!("Unrecognized status {:?}, reading again", token);
                        unknown = Some((token, reads));
                        return Step::Wait;
                    }
                };

                if last.as_ref() != Some(&status) {
                    self.sink.on_status(&status);
                    last = Some(status.clone());
                }

                if status.is_terminal() {
                    Step::Done(status)
                } else if status == UpdateStatus::PendingService
                    && started.elapsed() >= plan.pending_service_grace
                {
                    tracing::info!(
                        "Status still pending-service after grace period, treating as terminal"
                    );
                    Step::Done(status)
                } else {
                    Step::Wait
                }
            })
            .await
    }

    fn verify_tree(&self, plan: &AttemptPlan) -> Vec<crate::verify::Mismatch> {
        let manifest = if plan.expects_success() {
            &plan.success_manifest
        } else {
            &plan.failure_manifest
        };

        let verifier = TreeVerifier::new(plan.manifest_root(), &plan.reference_dir)
            .with_reserved_extensions(plan.reserved_extensions.clone());

        let mismatches = verifier.verify_all(manifest, &[plan.updates_dir.as_path()]);
        for mismatch in &mismatches {
            tracing::warn!("{}", mismatch);
        }
        mismatches
    }

    async fn check_callback(&self, plan: &AttemptPlan, callback: &CallbackPlan) -> Result<()> {
        if callback.launch_directly {
            let invocation = Invocation::new(&callback.program)
                .args(callback.args.iter())
                .current_dir(plan.updater_cwd());
            let code = self.runner.run(&invocation).await?;
            if code != 0 {
                return Err(UpdateError::ProcessExit {
                    program: callback.program.clone(),
                    code,
                });
            }
        }

        CallbackCheck::new(&callback.log, callback.args.clone())
            .with_stable_polls(callback.stable_polls)
            .wait(&callback.poller)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MemoryEnv;
    use crate::manifest::FileExpectation;
    use crate::paths::env;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Writes a fixed status (and optionally a file) when run
    struct ScriptedUpdater {
        status: &'static str,
        exit_code: i32,
        touch: Option<(&'static str, &'static str)>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedUpdater {
        fn new(status: &'static str, exit_code: i32) -> Self {
            Self {
                status,
                exit_code,
                touch: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedUpdater {
        async fn run(&self, invocation: &Invocation) -> Result<i32> {
            self.calls.lock().unwrap().push(invocation.clone());
            let args = invocation.args_lossy();
            let updates_dir = PathBuf::from(&args[0]);
            let target_dir = PathBuf::from(&args[1]);

            if let Some((rel, contents)) = self.touch {
                let path = target_dir.join(rel);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, contents).unwrap();
            }
            std::fs::write(files::status_file(&updates_dir), format!("{}\n", self.status)).unwrap();
            Ok(self.exit_code)
        }
    }

    #[derive(Default)]
    struct CountingSink {
        statuses: Mutex<Vec<UpdateStatus>>,
        completions: Mutex<u32>,
    }

    impl NotificationSink for CountingSink {
        fn on_status(&self, status: &UpdateStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }

        fn on_complete(&self, _outcome: &AttemptOutcome) {
            *self.completions.lock().unwrap() += 1;
        }
    }

    struct Fixture {
        _root: TempDir,
        plan: AttemptPlan,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let apply_dir = root.path().join("app");
        std::fs::create_dir_all(apply_dir.join("a/b")).unwrap();
        std::fs::write(apply_dir.join("a/b/text0"), "Original\n").unwrap();
        std::fs::write(root.path().join("updater"), "#!/bin/sh\n").unwrap();
        std::fs::write(root.path().join("complete.mar"), "MAR1").unwrap();

        let mut plan = AttemptPlan::new(
            root.path().join("run/updates"),
            &apply_dir,
            root.path().join("complete.mar"),
            root.path().join("updater"),
        );
        plan.status_poller = Poller::new(Duration::from_millis(1), Duration::from_secs(5));
        plan.pending_service_grace = Duration::from_millis(20);

        Fixture { _root: root, plan }
    }

    fn orchestrator(runner: Arc<dyn ProcessRunner>, sink: Arc<CountingSink>) -> UpdateOrchestrator {
        UpdateOrchestrator::new(runner)
            .with_env_store(Arc::new(MemoryEnv::new()))
            .with_sink(sink)
    }

    #[test]
    fn test_mode_args() {
        assert_eq!(UpdateMode::Foreground.arg(), "0");
        assert_eq!(UpdateMode::Background.arg(), "-1");
        assert_eq!(UpdateMode::Switch.arg(), "0/replace");
        assert_eq!(
            UpdateMode::Switch.target_dir(Path::new("/opt/app")),
            PathBuf::from("/opt/app/updated")
        );
    }

    #[test]
    fn test_manifest_root_follows_mode() {
        let mut plan = AttemptPlan::new("/u", "/a", "/m", "/bin/updater");
        assert_eq!(plan.manifest_root(), PathBuf::from("/a"));

        plan.mode = UpdateMode::Background;
        assert_eq!(plan.manifest_root(), PathBuf::from("/a/updated"));

        plan.mode = UpdateMode::Switch;
        assert_eq!(plan.manifest_root(), PathBuf::from("/a"));

        plan.verify_root = Some(PathBuf::from("/elsewhere"));
        assert_eq!(plan.manifest_root(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn test_updater_args_with_callback() {
        let mut plan = AttemptPlan::new("/u", "/a", "/m", "/bin/updater");
        plan.callback = Some(CallbackPlan {
            program: PathBuf::from("/bin/stub"),
            args: vec!["/a".into(), "callback.log".into(), "Test Arg 2".into()],
            log: PathBuf::from("/a/callback.log"),
            launch_directly: false,
            stable_polls: 3,
            poller: Poller::iterations(Duration::from_millis(1), 1),
        });

        let args: Vec<String> = plan
            .updater_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["/u", "/a", "0", "/a", "/bin/stub", "/a", "callback.log", "Test Arg 2"]);

        plan.mode = UpdateMode::Background;
        assert_eq!(plan.updater_args().len(), 3);
    }

    #[tokio::test]
    async fn test_successful_attempt() {
        let mut fx = fixture();
        fx.plan.success_manifest = TreeManifest::new()
            .file(FileExpectation::with_contents("a/b/text0", "ToBeModified\n"));

        let runner = Arc::new(ScriptedUpdater {
            touch: Some(("a/b/text0", "ToBeModified\n")),
            ..ScriptedUpdater::new("succeeded", 0)
        });
        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(runner.clone(), sink.clone()).run(&fx.plan).await;

        match outcome {
            AttemptOutcome::Success(summary) => {
                assert_eq!(summary.final_status, UpdateStatus::Succeeded);
                assert_eq!(summary.path, ExecutionPath::Direct);
            }
            AttemptOutcome::Failure(problems) => panic!("unexpected problems: {:?}", problems),
        }
        assert_eq!(*sink.completions.lock().unwrap(), 1);
        assert_eq!(*sink.statuses.lock().unwrap(), vec![UpdateStatus::Succeeded]);

        // The staged copy ran, with the attempt environment attached
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].program, fx.plan.updates_dir.join("updater"));
        assert_eq!(
            calls[0].env.get(env::APPDIR_OVERRIDE),
            Some(&Some(fx.plan.apply_dir.display().to_string()))
        );
        assert!(files::archive_file(&fx.plan.updates_dir).is_file());
        assert_eq!(
            StatusStore::new(&fx.plan.updates_dir).read_version().unwrap(),
            "99.0"
        );
    }

    #[tokio::test]
    async fn test_expected_failure_ignores_code() {
        let mut fx = fixture();
        fx.plan.expected_status = UpdateStatus::Failed(None);

        let runner = Arc::new(ScriptedUpdater::new("failed: 123", 1));
        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(runner, sink.clone()).run(&fx.plan).await;

        assert!(outcome.is_success(), "{:?}", outcome.problems());
        assert_eq!(*sink.completions.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_state_mismatch_still_verifies() {
        let fx = fixture();
        let runner = Arc::new(ScriptedUpdater {
            touch: Some(("a/b/text0.backup", "")),
            ..ScriptedUpdater::new("failed: 7", 0)
        });
        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(runner, sink.clone()).run(&fx.plan).await;

        let kinds: Vec<&str> = outcome.problems().iter().map(UpdateError::kind).collect();
        assert_eq!(kinds, vec!["state-mismatch", "verification"]);
        assert_eq!(*sink.completions.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let fx = fixture();
        let runner = Arc::new(ScriptedUpdater::new("succeeded", 4));
        let outcome = orchestrator(runner, Arc::new(CountingSink::default()))
            .run(&fx.plan)
            .await;

        assert!(matches!(
            outcome.problems(),
            [UpdateError::ProcessExit { code: 4, .. }]
        ));
    }

    #[tokio::test]
    async fn test_applying_forever_times_out_once() {
        let mut fx = fixture();
        fx.plan.status_poller = Poller::iterations(Duration::from_millis(1), 5);

        let runner = Arc::new(ScriptedUpdater::new("applying", 0));
        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(runner, sink.clone()).run(&fx.plan).await;

        assert!(matches!(outcome.problems(), [UpdateError::TimedOut { .. }]));
        assert_eq!(*sink.completions.lock().unwrap(), 1);
        assert_eq!(*sink.statuses.lock().unwrap(), vec![UpdateStatus::Applying]);
    }

    #[tokio::test]
    async fn test_pending_service_grace_period() {
        let mut fx = fixture();
        fx.plan.expected_status = UpdateStatus::PendingService;

        let runner = Arc::new(ScriptedUpdater::new("pending-service", 0));
        let outcome = orchestrator(runner, Arc::new(CountingSink::default()))
            .run(&fx.plan)
            .await;

        match outcome {
            AttemptOutcome::Success(summary) => {
                assert_eq!(summary.final_status, UpdateStatus::PendingService);
                assert!(summary.elapsed >= Duration::from_millis(20));
            }
            AttemptOutcome::Failure(problems) => panic!("unexpected problems: {:?}", problems),
        }
    }

    #[tokio::test]
    async fn test_settings_file_swapped_and_restored() {
        let mut fx = fixture();
        let ini = fx.plan.apply_dir.join(files::SETTINGS_INI);
        std::fs::write(&ini, "[Settings]\nACCEPTED_MAR_CHANNEL_IDS=release\n").unwrap();
        fx.plan.settings_ini = Some("[Settings]\nACCEPTED_MAR_CHANNEL_IDS=test\n".to_string());

        struct SettingsProbe {
            seen: Mutex<Option<String>>,
        }

        #[async_trait]
        impl ProcessRunner for SettingsProbe {
            async fn run(&self, invocation: &Invocation) -> Result<i32> {
                let args = invocation.args_lossy();
                let ini = PathBuf::from(&args[1]).join(files::SETTINGS_INI);
                *self.seen.lock().unwrap() = std::fs::read_to_string(ini).ok();
                std::fs::write(files::status_file(Path::new(&args[0])), "succeeded\n").unwrap();
                Ok(0)
            }
        }

        let runner = Arc::new(SettingsProbe {
            seen: Mutex::new(None),
        });
        let outcome = orchestrator(runner.clone(), Arc::new(CountingSink::default()))
            .run(&fx.plan)
            .await;

        assert!(outcome.is_success(), "{:?}", outcome.problems());
        assert_eq!(
            runner.seen.lock().unwrap().as_deref(),
            Some("[Settings]\nACCEPTED_MAR_CHANNEL_IDS=test\n")
        );
        assert_eq!(
            std::fs::read_to_string(&ini).unwrap(),
            "[Settings]\nACCEPTED_MAR_CHANNEL_IDS=release\n"
        );
        assert!(!fx.plan.apply_dir.join(files::SETTINGS_INI_BAK).exists());
    }

    #[tokio::test]
    async fn test_status_rewrite_gap_is_not_fatal() {
        let fx = fixture();

        /// Leaves the status file missing, then empty, and only later writes
        /// the final token
        struct SlowWriter;

        #[async_trait]
        impl ProcessRunner for SlowWriter {
            async fn run(&self, invocation: &Invocation) -> Result<i32> {
                let status = files::status_file(Path::new(&invocation.args_lossy()[0]));
                std::fs::remove_file(&status).unwrap();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(10));
                    std::fs::write(&status, "").unwrap();
                    std::thread::sleep(Duration::from_millis(20));
                    std::fs::write(&status, "succeeded\n").unwrap();
                });
                Ok(0)
            }
        }

        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(Arc::new(SlowWriter), sink.clone())
            .run(&fx.plan)
            .await;

        assert!(outcome.is_success(), "{:?}", outcome.problems());
        assert_eq!(*sink.statuses.lock().unwrap(), vec![UpdateStatus::Succeeded]);
    }

    #[tokio::test]
    async fn test_persistent_unknown_status_fails() {
        let fx = fixture();
        let runner = Arc::new(ScriptedUpdater::new("downloaded", 0));
        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(runner, sink.clone()).run(&fx.plan).await;

        assert!(matches!(
            outcome.problems(),
            [UpdateError::UnknownStatus(token)] if token == "downloaded"
        ));
        assert!(sink.statuses.lock().unwrap().is_empty());
        assert_eq!(*sink.completions.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_background_attempt_skips_relaunch_check() {
        let mut fx = fixture();
        fx.plan.mode = UpdateMode::Background;
        fx.plan.callback = Some(CallbackPlan {
            program: PathBuf::from("/bin/stub"),
            args: vec!["callback.log".into()],
            log: fx.plan.apply_dir.join("callback.log"),
            launch_directly: false,
            stable_polls: 1,
            poller: Poller::iterations(Duration::from_millis(1), 3),
        });
        fx.plan.success_manifest = TreeManifest::new()
            .file(FileExpectation::with_contents("a/b/text0", "ToBeModified\n"));

        let runner = Arc::new(ScriptedUpdater {
            touch: Some(("a/b/text0", "ToBeModified\n")),
            ..ScriptedUpdater::new("applied", 0)
        });
        fx.plan.expected_status = UpdateStatus::Applied;
        let outcome = orchestrator(runner.clone(), Arc::new(CountingSink::default()))
            .run(&fx.plan)
            .await;

        assert!(outcome.is_success(), "{:?}", outcome.problems());
        assert_eq!(runner.calls.lock().unwrap()[0].args.len(), 3);
        assert_eq!(
            std::fs::read_to_string(fx.plan.apply_dir.join("a/b/text0")).unwrap(),
            "Original\n"
        );
    }

    #[tokio::test]
    async fn test_missing_updater_aborts_before_launch() {
        let mut fx = fixture();
        fx.plan.updater = fx.plan.apply_dir.join("no-such-updater");

        let runner = Arc::new(ScriptedUpdater::new("succeeded", 0));
        let sink = Arc::new(CountingSink::default());
        let outcome = orchestrator(runner.clone(), sink.clone()).run(&fx.plan).await;

        assert!(matches!(outcome.problems(), [UpdateError::Io { .. }]));
        assert!(runner.calls.lock().unwrap().is_empty());
        assert_eq!(*sink.completions.lock().unwrap(), 1);
    }
}
