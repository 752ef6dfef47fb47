use std::time::Duration;
use tickbar_core::config::RetryConfig;
use tickbar_core::Error;
use tracing::warn;

/// Exponential backoff for blocking sink writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// The last error of an operation that ran out of attempts.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: usize,
    pub error: Error,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay_ms, config.max_delay_ms)
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, 0, 0)
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the zero-based attempt number.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, Exhausted>
    where
        F: FnMut(usize) -> tickbar_core::Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(val) => return Ok(val),
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !error.is_retryable() {
                        return Err(Exhausted {
                            attempts: attempt,
                            error,
                        });
                    }
                    let delay = self.next_delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying sink write");
                    std::thread::sleep(delay);
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
