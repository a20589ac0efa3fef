use log::warn;
use std::future::Future;
use std::time::Duration;

use crate::errors::Result;

/// Fixed-interval retry of retryable failures.
#[derive(Debug, Clone)]
pub struct Retry {
    name: String,
    max_attempts: u32,
    wait: Duration,
}

impl Retry {
    pub fn new(name: impl Into<String>, max_attempts: u32, wait: Duration) -> Self {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` calls have been made. The last error is returned.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    warn!(
                        "Call to {} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.name, attempt, self.max_attempts, self.wait, e
                    );
                    attempt += 1;
                    if !self.wait.is_zero() {
                        tokio::time::sleep(self.wait).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
