use std::{thread::sleep, time::Duration};

use rand::random;

use crate::{config::RetryConfig, errors::StoreError};

/// Exponential backoff for calls that leave the process.
///
/// Attempt `n` (1-based) sleeps `base * factor^(n-1)` plus up to a quarter of
/// `base` of random jitter. Only transient errors are retried; once the
/// retries are used up the last error is surfaced as `BackendUnavailable`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    factor: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, factor: u32) -> Self {
        Self {
            max_retries,
            base_delay,
            factor: factor.max(1),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            config.factor,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retry number `attempt`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exp))
    }

    fn jitter(&self) -> Duration {
        let spread = self.base_delay.as_millis() as u64 / 4;
        if spread == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(random::<u64>() % spread)
    }

    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt) + self.jitter();
                    log::info!(
                        "{label}: retrying (attempt {}/{}) after error: {}, backoff {}ms",
                        attempt,
                        self.max_retries,
                        err,
                        delay.as_millis()
                    );
                    sleep(delay);
                }
                Err(err) if err.is_transient() => {
                    log::error!("{label}: giving up after {} attempts: {err}", attempt + 1);
                    return Err(StoreError::BackendUnavailable {
                        attempts: attempt + 1,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
