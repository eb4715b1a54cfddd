//! Callback relaunch verification
//!
//! After a successful update the callback application is relaunched and
//! writes the arguments it received, one per line, to a log file. The file
//! may appear late or be written in pieces, so it is polled.

use crate::error::{Result, UpdateError};
use crate::poll::{Poller, Step};
use std::io::ErrorKind;
use std::path::PathBuf;

/// Consecutive identical mismatching reads before a mismatch is final
pub const DEFAULT_STABLE_POLLS: u32 = 3;

/// Result of reading the callback log once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackState {
    Absent,
    Matches,
    Differs(String),
}

#[derive(Debug, Clone)]
pub struct CallbackCheck {
    log_path: PathBuf,
    expected_args: Vec<String>,
    stable_polls: u32,
}

impl CallbackCheck {
    pub fn new(log_path: impl Into<PathBuf>, expected_args: Vec<String>) -> Self {
        Self {
            log_path: log_path.into(),
            expected_args,
            stable_polls: DEFAULT_STABLE_POLLS,
        }
    }

    pub fn with_stable_polls(mut self, stable_polls: u32) -> Self {
        self.stable_polls = stable_polls.max(1);
        self
    }

    /// One argument per line, newline terminated
    pub fn expected_contents(&self) -> String {
        let mut contents = self.expected_args.join("\n");
        contents.push('\n');
        contents
    }

    /// Read the log once
    pub fn check_once(&self) -> Result<CallbackState> {
        match std::fs::read_to_string(&self.log_path) {
            Ok(contents) if contents == self.expected_contents() => Ok(CallbackState::Matches),
            Ok(contents) => Ok(CallbackState::Differs(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CallbackState::Absent),
            Err(e) => Err(UpdateError::io(&self.log_path, e)),
        }
    }

    /// Poll until the log matches, a mismatch stays put for `stable_polls`
    /// reads, or the poller gives up
    pub async fn wait(&self, poller: &Poller) -> Result<()> {
        self.wait_with(poller, |_| {}).await
    }

    /// [`wait`](Self::wait), running `before_check` with the iteration
    /// number ahead of every read
    pub async fn wait_with<F>(&self, poller: &Poller, mut before_check: F) -> Result<()>
    where
        F: FnMut(u32),
    {
        let expected = self.expected_contents();
        let mut last_seen: Option<String> = None;
        let mut streak = 0u32;

        let result = poller
            .run("callback log", |iteration| {
                before_check(iteration);
                self.step(&expected, &mut last_seen, &mut streak)
            })
            .await;

        if let Err(UpdateError::TimedOut { .. }) = result {
            match last_seen {
                Some(ref observed) => tracing::warn!(
                    "Callback log {} never matched, last contents: {:?}",
                    self.log_path.display(),
                    observed
                ),
                None => tracing::warn!("Callback log {} never appeared", self.log_path.display()),
            }
        }

        result
    }

    fn step(&self, expected: &str, last_seen: &mut Option<String>, streak: &mut u32) -> Step<()> {
        match self.check_once() {
            Ok(CallbackState::Matches) => Step::Done(()),
            Ok(CallbackState::Absent) => {
                *last_seen = None;
                *streak = 0;
                Step::Wait
            }
            Ok(CallbackState::Differs(observed)) => {
                if last_seen.as_deref() == Some(observed.as_str()) {
                    *streak += 1;
                } else {
                    *last_seen = Some(observed.clone());
                    *streak = 1;
                }

                if *streak >= self.stable_polls {
                    Step::Fail(UpdateError::CallbackMismatch {
                        expected: expected.to_string(),
                        observed,
                    })
                } else {
                    Step::Wait
                }
            }
            Err(e) => Step::Fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn args() -> Vec<String> {
        vec!["./".into(), "callback.log".into(), "Test Arg 2".into(), "Test Arg 3".into()]
    }

    #[test]
    fn test_expected_contents_one_per_line() {
        let check = CallbackCheck::new("/tmp/callback.log", args());
        assert_eq!(check.expected_contents(), "./\ncallback.log\nTest Arg 2\nTest Arg 3\n");
    }

    #[test]
    fn test_absent_then_matching_file() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("callback.log");
        let check = CallbackCheck::new(&log, args());

        // Nothing there for the first three polls
        for _ in 0..3 {
            assert_eq!(check.check_once().unwrap(), CallbackState::Absent);
        }

        std::fs::write(&log, check.expected_contents()).unwrap();
        assert_eq!(check.check_once().unwrap(), CallbackState::Matches);
    }

    #[tokio::test]
    async fn test_wait_matches_on_first_check_after_file_appears() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("callback.log");
        let check = CallbackCheck::new(&log, args());
        let contents = check.expected_contents();
        let mut last_iteration = 0;

        // Absent for three checks; the fourth is the last the budget allows
        let poller = Poller::iterations(Duration::from_millis(1), 4);
        check
            .wait_with(&poller, |iteration| {
                last_iteration = iteration;
                if iteration == 4 {
                    std::fs::write(&log, &contents).unwrap();
                }
            })
            .await
            .unwrap();

        assert_eq!(last_iteration, 4);
    }

    #[tokio::test]
    async fn test_partial_write_is_not_final() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("callback.log");
        std::fs::write(&log, "./\n").unwrap();

        let check = CallbackCheck::new(&log, args()).with_stable_polls(50);
        let contents = check.expected_contents();
        let writer = {
            let log = log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tokio::fs::write(&log, contents).await.unwrap();
            })
        };

        let poller = Poller::new(Duration::from_millis(2), Duration::from_secs(10));
        check.wait(&poller).await.unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_stable_mismatch_is_definitive() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("callback.log");
        std::fs::write(&log, "wrong\n").unwrap();

        let check = CallbackCheck::new(&log, args());
        let poller = Poller::iterations(Duration::from_millis(1), 20);
        let err = check.wait(&poller).await.unwrap_err();

        match err {
            UpdateError::CallbackMismatch { observed, .. } => assert_eq!(observed, "wrong\n"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_never_appearing_times_out() {
        let dir = TempDir::new().unwrap();
        let check = CallbackCheck::new(dir.path().join("callback.log"), args());
        let poller = Poller::iterations(Duration::from_millis(1), 4);

        assert!(matches!(
            check.wait(&poller).await,
            Err(UpdateError::TimedOut { iterations: 4, .. })
        ));
    }
}
