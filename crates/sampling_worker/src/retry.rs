use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use dynamic_sampling::sliding_window::TaskOutcome;
use dynamic_sampling::task_context::TaskError;
use tokio::time::sleep;
use tracing::{debug, error, warn};

pub enum RetryAction {
    /// Indicate that this run should be retried with a reason
    Retry(Cow<'static, str>),
    /// Indicate that this run should not be retried with a reason
    DontRetry(Cow<'static, str>),
    /// Indicate that this run should not be retried because it succeeded
    Successful,
}

/// The jitter mode to use for retry delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// No jitter.
    #[default]
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the configured delay. Spreads out
    /// retries of workers that failed together, e.g. after a store outage.
    Full,
}

/// Fixed-delay retry policy for a whole task run.
#[derive(Debug, Clone)]
pub struct TaskRetryPolicy {
    remaining_attempts: usize,
    delay: Duration,
    jitter_mode: JitterMode,
    current_jitter_duration: Duration,
}

impl TaskRetryPolicy {
    pub fn new(remaining_attempts: usize, delay: Duration, jitter_mode: JitterMode) -> Self {
        TaskRetryPolicy {
            remaining_attempts,
            delay,
            jitter_mode,
            current_jitter_duration: Self::add_full_jitter(delay),
        }
    }

    fn add_full_jitter(d: Duration) -> Duration {
        let millis = d.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        let jitter = (rand::random::<u64>() % millis) + 1;
        Duration::from_millis(jitter)
    }

    fn advance(&self) -> TaskRetryPolicy {
        TaskRetryPolicy {
            remaining_attempts: self.remaining_attempts.saturating_sub(1),
            delay: self.delay,
            jitter_mode: self.jitter_mode,
            current_jitter_duration: Self::add_full_jitter(self.delay),
        }
    }

    pub const fn backoff(&self) -> Duration {
        match self.jitter_mode {
            JitterMode::None => self.delay,
            JitterMode::Full => self.current_jitter_duration,
        }
    }

    pub const fn remaining_attempts(&self) -> usize {
        self.remaining_attempts
    }

    pub fn classify(&self, result: &Result<TaskOutcome, TaskError>) -> RetryAction {
        match result {
            Ok(_) => RetryAction::Successful,
            Err(_) if self.remaining_attempts == 0 => RetryAction::DontRetry(Cow::Borrowed("retries exhausted")),
            Err(TaskError::Timeout { .. }) => RetryAction::Retry(Cow::Borrowed("task exceeded its time budget")),
            Err(error) => RetryAction::Retry(Cow::Owned(error.to_string())),
        }
    }
}

/// Runs `run` until it succeeds or the policy gives up, sleeping between attempts.
///
/// Every failure is retried; the last error is returned once attempts run out.
pub async fn run_with_retries<F, Fut>(mut policy: TaskRetryPolicy, mut run: F) -> Result<TaskOutcome, TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TaskOutcome, TaskError>>,
{
    loop {
        let result = run().await;
        match policy.classify(&result) {
            RetryAction::Successful => return result,
            RetryAction::DontRetry(reason) => {
                if let Err(error) = &result {
                    error!(message = "Not retrying task run.", reason = %reason, %error);
                }
                return result;
            }
            RetryAction::Retry(reason) => {
                let delay = policy.backoff();
                warn!(message = "Retrying task run.", reason = %reason, delay_ms = %delay.as_millis());
                sleep(delay).await;
                policy = policy.advance();
                debug!(message = "Task retry starting.", attempts_remaining = policy.remaining_attempts());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;

    fn timeout() -> TaskError {
        TaskError::Timeout {
            task_name: "sliding_window_org".to_string(),
            elapsed: Duration::from_secs(61),
        }
    }

    #[test]
    fn fixed_delay_without_jitter() {
        let mut policy = TaskRetryPolicy::new(5, Duration::from_secs(5), JitterMode::None);
        for _ in 0..5 {
            assert_eq!(policy.backoff(), Duration::from_secs(5));
            policy = policy.advance();
        }
        assert_eq!(policy.remaining_attempts(), 0);
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let delay = Duration::from_secs(5);
        let mut policy = TaskRetryPolicy::new(10, delay, JitterMode::Full);
        for attempt in 0..10 {
            let backoff = policy.backoff();
            assert!(
                !backoff.is_zero() && backoff <= delay,
                "Attempt {}: Expected backoff within 0 and {:?}, got {:?}",
                attempt,
                delay,
                backoff
            );
            policy = policy.advance();
        }
    }

    #[tokio::test]
    async fn failed_runs_are_retried_until_success() {
        time::pause();

        let attempts = AtomicUsize::new(0);
        let policy = TaskRetryPolicy::new(5, Duration::from_secs(5), JitterMode::None);

        let result = run_with_retries(policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(timeout())
            } else {
                Ok(TaskOutcome::Completed {
                    orgs_seen: 3,
                    rates_written: 3,
                })
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn waits_for_the_delay_between_attempts() {
        time::pause();

        let attempts = AtomicUsize::new(0);
        let policy = TaskRetryPolicy::new(1, Duration::from_secs(5), JitterMode::None);

        let mut fut = task::spawn(run_with_retries(policy, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(timeout())
            } else {
                Ok(TaskOutcome::Disabled)
            }
        }));

        assert_pending!(fut.poll());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_secs(2)).await;
        assert_pending!(fut.poll());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // The timer resolves on millisecond ticks, so step just past the deadline.
        time::advance(Duration::from_secs(3) + Duration::from_millis(1)).await;
        assert_eq!(assert_ready_ok!(fut.poll()), TaskOutcome::Disabled);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        time::pause();

        let attempts = AtomicUsize::new(0);
        let policy = TaskRetryPolicy::new(5, Duration::from_secs(5), JitterMode::None);
        let started = time::Instant::now();

        let result = run_with_retries(policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(timeout())
        })
        .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(started.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test]
    async fn disabled_runs_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let policy = TaskRetryPolicy::new(5, Duration::from_secs(5), JitterMode::None);

        let result = run_with_retries(policy, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(TaskOutcome::Disabled)
        })
        .await;

        assert_eq!(result.unwrap(), TaskOutcome::Disabled);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
