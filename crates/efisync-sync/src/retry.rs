//! Retry/Backoff Controller
//!
//! Runs an operation up to a bounded number of attempts. A retryable
//! failure sleeps `base_delay * 2^(attempt-1)`, capped at `max_delay`,
//! plus up to `jitter` of that delay at random. Terminal failures return
//! immediately without consuming further attempts. Whether a failure is
//! retryable is decided only by its [`ErrorKind`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use efisync_core::{
    config::RetryConfig,
    domain::{ErrorKind, TransferError},
};
use rand::Rng;
use tracing::{debug, info};

/// Failures that can be classified by the policy table
pub trait Classify {
    fn error_kind(&self) -> ErrorKind;
}

impl Classify for TransferError {
    fn error_kind(&self) -> ErrorKind {
        self.kind
    }
}

impl Classify for std::io::Error {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::from_io(self)
    }
}

/// The result of [`RetryPolicy::execute`] together with the attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Policy without jitter and a 60 s cap
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// without jitter
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay before retrying after failed attempt number `attempt`, with jitter
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = delay.mul_f64(self.jitter * rand::thread_rng().gen::<f64>());
        delay + extra
    }

    /// Run `operation` until it succeeds, fails terminally, or `max_attempts`
    /// attempts have been made
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(
        &self,
        op_name: &str,
        max_attempts: u32,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = op_name, attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let kind = err.error_kind();
                    if !kind.is_retryable() || attempt >= max_attempts {
                        debug!(
                            operation = op_name,
                            attempt,
                            error_kind = %kind,
                            error = %err,
                            "Giving up"
                        );
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error_kind = %kind,
                        error = %err,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn err(kind: ErrorKind) -> TransferError {
        TransferError::new(kind, "test")
    }

    #[test]
    fn test_delays_double_and_cap() {
        let p = RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(4), Duration::from_secs(5));
        assert_eq!(p.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let p = RetryPolicy::new(3, Duration::from_millis(1000)).with_jitter(0.1);
        for _ in 0..100 {
            let d = p.delay_for(1);
            assert!(d >= Duration::from_millis(1000));
            assert!(d <= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_then_success() {
        let p = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let c = calls.clone();
        let outcome = p
            .execute("flaky", 5, move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(err(ErrorKind::NetworkTimeout))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        // 1 s + 2 s of backoff on the paused clock
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let p = RetryPolicy::new(5, Duration::from_secs(1));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let c = calls.clone();
        let outcome: RetryOutcome<(), _> = p
            .execute("full", 5, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(err(ErrorKind::DestinationFull)) }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::DestinationFull);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let p = RetryPolicy::new(3, Duration::from_millis(100));
        let outcome: RetryOutcome<(), _> = p
            .execute("down", 3, |_| async { Err(err(ErrorKind::ConnectionRefused)) })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_number_is_passed() {
        let p = RetryPolicy::new(3, Duration::from_millis(10));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        let _: RetryOutcome<(), TransferError> = p
            .execute("count", 3, move |n| {
                s.lock().unwrap().push(n);
                async { Err(err(ErrorKind::DeviceBusy)) }
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_from_config() {
        let p = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(p.max_attempts(), 3);
        assert_eq!(p.base_delay_for(1), Duration::from_secs(1));
        assert_eq!(p.base_delay_for(10), Duration::from_secs(60));
    }
}
