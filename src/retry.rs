use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const MIN_ATTEMPTS: u32 = 1;
pub const MAX_ATTEMPTS: u32 = 5;

/// Receives the outcome of every attempt made by a [`RetryPolicy`].
pub trait RetryObserver: Send + Sync {
    fn on_success(&self, label: &str, attempt: u32);
    fn on_retry(&self, label: &str, attempt: u32, max_attempts: u32, delay: Duration, error: &str);
    fn on_exhausted(&self, label: &str, attempts: u32, error: &str);
}

/// Default observer, writes everything to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RetryObserver for LogObserver {
    fn on_success(&self, label: &str, attempt: u32) {
        debug!(op = label, attempt = attempt, "Succeeded.");
    }

    fn on_retry(&self, label: &str, attempt: u32, max_attempts: u32, delay: Duration, error: &str) {
        warn!(
            op = label,
            attempt = attempt,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = error,
            "Attempt failed, retrying."
        );
    }

    fn on_exhausted(&self, label: &str, attempts: u32, error: &str) {
        error!(op = label, attempts = attempts, error = error, "Failed.");
    }
}

/// Bounded re-invocation with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call and is clamped to 1..=5.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.clamp(MIN_ATTEMPTS, MAX_ATTEMPTS),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `op` until it returns `Ok` or the attempts run out.
    ///
    /// The last error is returned when every attempt failed.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        observer: &dyn RetryObserver,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    observer.on_success(label, attempt);
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts => {
                    observer.on_retry(label, attempt, self.max_attempts, self.delay, &e.to_string());
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    observer.on_exhausted(label, attempt, &e.to_string());
                    return Err(e);
                }
            }
        }
    }
}
