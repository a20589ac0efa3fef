use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Token bucket configuration.
#[derive(Debug, Clone)]
pub struct TokenBucketConfig {
    /// Tokens available when the bucket is full.
    pub capacity: u64,
    /// Tokens added at the end of every period.
    pub refill_tokens: u64,
    pub refill_period: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_tokens: 10,
            refill_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Non-blocking token bucket guarding calls to an external service.
///
/// Refills happen lazily on acquisition, in whole periods, so a bucket that
/// sat idle for three periods gains three refills capped at `capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    /// Take one token if available. Never waits.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }

    pub async fn available(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.config.refill_period.is_zero() {
            state.tokens = self.config.capacity;
            state.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.last_refill);
        let periods = (elapsed.as_nanos() / self.config.refill_period.as_nanos()) as u64;
        if periods == 0 {
            return;
        }
        let added = periods.saturating_mul(self.config.refill_tokens);
        state.tokens = state.tokens.saturating_add(added).min(self.config.capacity);
        let advance = u32::try_from(periods)
            .ok()
            .and_then(|p| self.config.refill_period.checked_mul(p));
        state.last_refill = advance.map_or(now, |d| state.last_refill + d);
    }
}
