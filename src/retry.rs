//! Exponential backoff with jitter for transient failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::random;

/// Upper bound for a single backoff sleep
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Backoff {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1)
    /// plus up to 40% of base as jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let delay = Duration::from_millis(exp.saturating_add(rand_jitter(base_ms)));
        delay.min(MAX_DELAY)
    }

    /// Run a blocking operation, retrying errors accepted by `is_retryable`.
    pub fn run_blocking<T, E: Display>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, E>,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    log::info!(
                        "{label}: retrying (attempt {attempt}/{}) after error: {e}, backoff {}ms",
                        self.max_retries,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Async variant of `run_blocking`; sleeps on the tokio timer.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    log::info!(
                        "{label}: retrying (attempt {attempt}/{}) after error: {e}, backoff {}ms",
                        self.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn rand_jitter(base_ms: u64) -> u64 {
    let span = base_ms * 2 / 5;
    if span == 0 {
        return 0;
    }
    random::<u64>() % span
}
