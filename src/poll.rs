//! Bounded polling
//!
//! Every wait in an update attempt is a loop of cheap checks separated by a
//! fixed interval, bounded by an iteration count, a wall-clock timeout, or
//! both. Exhausting the budget yields [`UpdateError::TimedOut`].

use crate::error::{Result, UpdateError};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Outcome of one check
#[derive(Debug)]
pub enum Step<T> {
    Done(T),
    Wait,
    Fail(UpdateError),
}

#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    max_iterations: Option<u32>,
    timeout: Option<Duration>,
}

impl Poller {
    /// Poll every `interval` until `timeout` has elapsed
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_iterations: None,
            timeout: Some(timeout),
        }
    }

    /// Poll every `interval` at most `max_iterations` times
    pub fn iterations(interval: Duration, max_iterations: u32) -> Self {
        Self {
            interval,
            max_iterations: Some(max_iterations),
            timeout: None,
        }
    }

    /// Run `check` (given the 1-based iteration) until it finishes or the
    /// budget runs out
    pub async fn run<T, F>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut(u32) -> Step<T>,
    {
        let start = Instant::now();
        let mut iteration = 0u32;

        loop {
            iteration += 1;

            match check(iteration) {
                Step::Done(value) => {
                    tracing::debug!("{} finished after {} check(s)", what, iteration);
                    return Ok(value);
                }
                Step::Fail(e) => return Err(e),
                Step::Wait => {}
            }

            let out_of_iterations = self.max_iterations.is_some_and(|max| iteration >= max);
            let out_of_time = self.timeout.is_some_and(|t| start.elapsed() >= t);

            if out_of_iterations || out_of_time {
                return Err(UpdateError::TimedOut {
                    what: what.to_string(),
                    iterations: iteration,
                    elapsed: start.elapsed(),
                });
            }

            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn test_done_on_later_iteration() {
        let poller = Poller::iterations(TICK, 10);
        let result = poller
            .run("counter", |i| if i == 4 { Step::Done(i) } else { Step::Wait })
            .await
            .unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn test_iteration_budget_exhausted() {
        let poller = Poller::iterations(TICK, 5);
        let mut calls = 0;
        let err = poller
            .run::<(), _>("helpers to stop", |_| {
                calls += 1;
                Step::Wait
            })
            .await
            .unwrap_err();

        assert_eq!(calls, 5);
        match err {
            UpdateError::TimedOut { what, iterations, .. } => {
                assert_eq!(what, "helpers to stop");
                assert_eq!(iterations, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wall_clock_timeout() {
        let poller = Poller::new(Duration::from_millis(5), Duration::from_millis(30));
        let err = poller.run::<(), _>("status", |_| Step::Wait).await.unwrap_err();
        assert!(matches!(err, UpdateError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_fail_stops_immediately() {
        let poller = Poller::iterations(TICK, 10);
        let mut calls = 0;
        let err = poller
            .run::<(), _>("status", |_| {
                calls += 1;
                Step::Fail(UpdateError::UnknownStatus("bogus".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, UpdateError::UnknownStatus(_)));
    }
}
