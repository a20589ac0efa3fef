//! Guards around calls to the external recognition service.

pub mod breaker;
pub mod rate_limit;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use rate_limit::{TokenBucket, TokenBucketConfig};
pub use retry::Retry;

use std::future::Future;
use std::time::Duration;

use crate::common::model::config::IntegrationConfig;
use crate::errors::{Error, Result};

/// Rate limiter, retry and circuit breaker for one target service.
///
/// Order of application: the limiter is consulted once per logical
/// operation; each remote call inside it is retried, and every attempt
/// passes through the breaker.
#[derive(Debug)]
pub struct ResilienceEnvelope {
    limiter: TokenBucket,
    retry: Retry,
    breaker: CircuitBreaker,
}

impl ResilienceEnvelope {
    pub fn new(limiter: TokenBucket, retry: Retry, breaker: CircuitBreaker) -> Self {
        Self {
            limiter,
            retry,
            breaker,
        }
    }

    pub fn from_config(config: &IntegrationConfig) -> Self {
        let name = config.target_service_name.clone();
        Self {
            limiter: TokenBucket::new(TokenBucketConfig {
                capacity: config.rate_limiter_capacity,
                refill_tokens: config.rate_limiter_refill_tokens,
                refill_period: Duration::from_millis(config.rate_limiter_refill_period_ms),
            }),
            retry: Retry::new(
                name.clone(),
                config.retry_max_attempts,
                Duration::from_millis(config.retry_wait_ms),
            ),
            breaker: CircuitBreaker::new(
                name,
                BreakerConfig {
                    failure_rate_threshold: config.breaker_failure_rate_threshold,
                    sliding_window_size: config.breaker_sliding_window_size,
                    wait_in_open: Duration::from_millis(config.breaker_wait_in_open_ms),
                    half_open_calls: config.breaker_half_open_calls,
                },
            ),
        }
    }

    /// Fails with `TooManyRequests` when the bucket is empty.
    pub async fn acquire(&self) -> Result<()> {
        if self.limiter.try_acquire().await {
            Ok(())
        } else {
            Err(Error::too_many_requests())
        }
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry.execute(|| self.breaker.call(op())).await
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
