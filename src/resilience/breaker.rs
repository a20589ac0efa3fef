use log::{info, warn};
use metrics::counter;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::errors::{IntegrationError, Result};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure percentage at or above which the breaker opens.
    pub failure_rate_threshold: f32,
    /// Outcomes considered while closed.
    pub sliding_window_size: usize,
    pub wait_in_open: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            sliding_window_size: 10,
            wait_in_open: Duration::from_secs(10),
            half_open_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { window: VecDeque<bool> },
    Open { until: Instant },
    HalfOpen { admitted: usize, outcomes: Vec<bool> },
}

/// Count-based circuit breaker.
///
/// Closed: the last `sliding_window_size` outcomes are kept; once the window is
/// full and the failure rate reaches the threshold the breaker opens.
/// Open: every call is rejected with `CallNotPermitted` until `wait_in_open`
/// has elapsed, then the breaker turns half-open.
/// Half-open: `half_open_calls` probes are admitted and their failure rate
/// decides between closing and reopening.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::Closed {
                window: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> BreakerState {
        let mut state = self.state.lock().await;
        self.expire_open(&mut state);
        match *state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Run `fut` if the breaker permits it and record its outcome.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_permission().await?;
        let result = fut.await;
        self.record(result.is_ok()).await;
        result
    }

    async fn acquire_permission(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.expire_open(&mut state);
        match &mut *state {
            State::Closed { .. } => Ok(()),
            State::Open { .. } => {
                counter!("integration_breaker_rejected_total", "service" => self.name.clone())
                    .increment(1);
                Err(IntegrationError::CallNotPermitted(self.name.clone()).into())
            }
            State::HalfOpen { admitted, .. } => {
                if *admitted < self.config.half_open_calls.max(1) {
                    *admitted += 1;
                    Ok(())
                } else {
                    Err(IntegrationError::CallNotPermitted(self.name.clone()).into())
                }
            }
        }
    }

    async fn record(&self, success: bool) {
        let mut state = self.state.lock().await;
        let next = match &mut *state {
            State::Closed { window } => {
                window.push_back(success);
                while window.len() > self.config.sliding_window_size {
                    window.pop_front();
                }
                if window.len() >= self.config.sliding_window_size
                    && self.failure_rate(window.iter()) >= self.config.failure_rate_threshold
                {
                    Some(self.open_state())
                } else {
                    None
                }
            }
            // Outcome of a call admitted before the breaker opened
            State::Open { .. } => None,
            State::HalfOpen { outcomes, .. } => {
                outcomes.push(success);
                let probes = self.config.half_open_calls.max(1);
                if outcomes.len() < probes {
                    None
                } else if self.failure_rate(outcomes.iter()) >= self.config.failure_rate_threshold {
                    Some(self.open_state())
                } else {
                    info!("Circuit breaker {} closed", self.name);
                    Some(State::Closed {
                        window: VecDeque::new(),
                    })
                }
            }
        };
        if let Some(next) = next {
            *state = next;
        }
    }

    fn open_state(&self) -> State {
        warn!(
            "Circuit breaker {} opened for {:?}",
            self.name, self.config.wait_in_open
        );
        counter!("integration_breaker_open_total", "service" => self.name.clone()).increment(1);
        State::Open {
            until: Instant::now() + self.config.wait_in_open,
        }
    }

    fn expire_open(&self, state: &mut State) {
        if let State::Open { until } = state
            && Instant::now() >= *until
        {
            info!("Circuit breaker {} half-open", self.name);
            *state = State::HalfOpen {
                admitted: 0,
                outcomes: Vec::new(),
            };
        }
    }

    fn failure_rate<'a>(&self, outcomes: impl Iterator<Item = &'a bool>) -> f32 {
        let (total, failed) = outcomes.fold((0usize, 0usize), |(t, f), ok| {
            (t + 1, if *ok { f } else { f + 1 })
        });
        if total == 0 {
            return 0.0;
        }
        failed as f32 * 100.0 / total as f32
    }
}
