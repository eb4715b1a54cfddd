//! Process Runner
//!
//! Trait seams over the two things the orchestrator asks of the operating
//! system: running a child to completion ([`ProcessRunner`]) and checking
//! whether a helper process is still alive ([`ProcessProbe`]).
//!
//! Production code uses [`SystemProcessRunner`] and [`SysinfoProbe`]; tests
//! supply fakes.

use crate::error::{Result, UpdateError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::Command;

/// One child process launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,

    /// Per-key override: `Some` sets, `None` removes
    pub env: BTreeMap<String, Option<String>>,

    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), Some(value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env.insert(key.into(), None);
        self
    }

    pub fn envs(mut self, overrides: BTreeMap<String, Option<String>>) -> Self {
        self.env.extend(overrides);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Arguments as lossy UTF-8, for logs and fakes
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// Runs a child process to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn, wait, and return the exit code. Spawn failures are
    /// [`UpdateError::ProcessLaunch`]; the exit code is never interpreted.
    async fn run(&self, invocation: &Invocation) -> Result<i32>;
}

/// Spawns real processes through tokio
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<i32> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);

        for (key, value) in &invocation.env {
            match value {
                Some(v) => cmd.env(key, v),
                None => cmd.env_remove(key),
            };
        }

        if let Some(ref cwd) = invocation.cwd {
            cmd.current_dir(cwd);
        }

        tracing::info!(
            "Running {} {}",
            invocation.program.display(),
            invocation.args_lossy().join(" ")
        );

        let status = cmd.status().await.map_err(|e| UpdateError::ProcessLaunch {
            program: invocation.program.clone(),
            source: e,
        })?;

        let code = exit_code(status);
        tracing::debug!("{} exited with {}", invocation.program.display(), code);
        Ok(code)
    }
}

/// Exit code, with Unix signal terminations mapped to 128 + signal
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

/// Answers whether a named process is running
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, name: &str) -> bool;

    /// The subset of `names` currently running
    fn running<'a>(&self, names: &[&'a str]) -> Vec<&'a str> {
        names
            .iter()
            .copied()
            .filter(|name| self.is_running(name))
            .collect()
    }
}

/// Process table lookups through sysinfo
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl ProcessProbe for SysinfoProbe {
    fn is_running(&self, name: &str) -> bool {
        let mut sys = sysinfo::System::new();
        sys.refresh_processes();
        let mut matching = sys.processes_by_exact_name(name);
        matching.next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Vec<&'static str>);

    impl ProcessProbe for FixedProbe {
        fn is_running(&self, name: &str) -> bool {
            self.0.iter().any(|n| *n == name)
        }
    }

    #[test]
    fn test_invocation_builder() {
        let inv = Invocation::new("/opt/app/updater")
            .args(["/tmp/updates", "/opt/app", "0"])
            .arg("/tmp")
            .env("UPSTAGE_NO_HASH_DIR", "1")
            .env_remove("LD_PRELOAD")
            .current_dir("/tmp");

        assert_eq!(inv.args_lossy(), vec!["/tmp/updates", "/opt/app", "0", "/tmp"]);
        assert_eq!(inv.env.get("UPSTAGE_NO_HASH_DIR"), Some(&Some("1".to_string())));
        assert_eq!(inv.env.get("LD_PRELOAD"), Some(&None));
        assert_eq!(inv.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn test_probe_running_subset() {
        let probe = FixedProbe(vec!["upstage-service"]);
        assert_eq!(
            probe.running(&["upstage-service-installer", "upstage-service"]),
            vec!["upstage-service"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_exit_code_and_env() {
        let runner = SystemProcessRunner::new();

        let inv = Invocation::new("/bin/sh")
            .args(["-c", "test \"$UPSTAGE_PROBE\" = yes && exit 3"])
            .env("UPSTAGE_PROBE", "yes");
        assert_eq!(runner.run(&inv).await.unwrap(), 3);

        let inv = Invocation::new("/bin/sh").args(["-c", "exit 0"]);
        assert_eq!(runner.run(&inv).await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_signal_maps_to_128_plus() {
        let runner = SystemProcessRunner::new();
        let inv = Invocation::new("/bin/sh").args(["-c", "kill -9 $$"]);
        assert_eq!(runner.run(&inv).await.unwrap(), 128 + 9);
    }

    #[tokio::test]
    async fn test_system_runner_launch_failure() {
        let runner = SystemProcessRunner::new();
        let inv = Invocation::new("/nonexistent/upstage-updater");
        assert!(matches!(
            runner.run(&inv).await,
            Err(UpdateError::ProcessLaunch { .. })
        ));
    }

    #[test]
    fn test_sysinfo_probe_unknown_name() {
        assert!(!SysinfoProbe.is_running("upstage-no-such-process-name"));
    }
}
