//! Circuit breaker and bounded exponential backoff around the completion backend.
//!
//! The breaker has three states:
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected without reaching the backend
//! - **HalfOpen**: after the reset timeout, probe calls are let through and
//!   `success_threshold` consecutive successes close the circuit again

use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::services::llm::{LlmClient, LlmError, LlmResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    #[serde(default = "default_breaker_name")]
    pub breaker_name: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub half_open_success_threshold: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_breaker_name() -> String {
    "completion-backend".to_string()
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_secs() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker_name: default_breaker_name(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            half_open_success_threshold: default_success_threshold(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    open_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub open_count: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, reset_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                total_failures: 0,
                total_successes: 0,
                open_count: 0,
            }),
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            &config.breaker_name,
            config.failure_threshold,
            Duration::from_secs(config.reset_timeout_secs),
            config.half_open_success_threshold,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves an expired open circuit to half-open.
    fn refresh(&self, s: &mut BreakerState) {
        if s.state == CircuitState::Open {
            if let Some(opened_at) = s.opened_at {
                if opened_at.elapsed() >= self.reset_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.half_open_successes = 0;
                    info!("Circuit breaker '{}' transitioning from open to half-open", self.name);
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut s = self.lock();
        self.refresh(&mut s);
        s.state
    }

    /// Returns the remaining open time when the call must be rejected.
    pub fn allow_request(&self) -> Result<(), Duration> {
        let mut s = self.lock();
        self.refresh(&mut s);
        match s.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(self.reset_timeout.saturating_sub(elapsed))
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.lock();
        s.total_successes += 1;
        s.consecutive_failures = 0;
        if s.state == CircuitState::HalfOpen {
            s.half_open_successes += 1;
            if s.half_open_successes >= self.success_threshold {
                s.state = CircuitState::Closed;
                s.opened_at = None;
                s.half_open_successes = 0;
                info!(
                    "Circuit breaker '{}' closing after {} successful probes",
                    self.name, self.success_threshold
                );
            }
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.lock();
        s.total_failures += 1;
        s.consecutive_failures += 1;
        match s.state {
            CircuitState::Closed => {
                if s.consecutive_failures >= self.failure_threshold {
                    s.state = CircuitState::Open;
                    s.opened_at = Some(Instant::now());
                    s.open_count += 1;
                    warn!(
                        "Circuit breaker '{}' opening after {} consecutive failures (reset in {:?})",
                        self.name, s.consecutive_failures, self.reset_timeout
                    );
                }
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
                s.half_open_successes = 0;
                s.open_count += 1;
                warn!("Circuit breaker '{}' re-opening after a failed probe", self.name);
            }
            CircuitState::Open => {
                s.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut s = self.lock();
        self.refresh(&mut s);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            total_failures: s.total_failures,
            total_successes: s.total_successes,
            open_count: s.open_count,
        }
    }
}

/// Wraps a completion backend with the breaker and bounded retries.
#[derive(Debug)]
pub struct ResilientLlm {
    inner: Arc<dyn LlmClient>,
    breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
}

impl ResilientLlm {
    pub fn new(inner: Arc<dyn LlmClient>, breaker: Arc<CircuitBreaker>, config: &ResilienceConfig) -> Self {
        Self {
            inner,
            breaker,
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// `base * 2^(attempt-1)`, capped, then spread by the jitter factor.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max_delay_ms);

        let jitter_range = (capped as f64 * self.jitter_factor) as i64;
        let millis = if jitter_range > 0 {
            let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
            (capped as i64 + jitter).max(0) as u64
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

/// Failures that say something about the backend's health.
fn counts_against_breaker(error: &LlmError) -> bool {
    matches!(
        error,
        LlmError::Network(_) | LlmError::Server { .. } | LlmError::InvalidResponse(_) | LlmError::RateLimited { .. }
    )
}

#[async_trait]
impl LlmClient for ResilientLlm {
    async fn chat(&self, system: &str, user: &str) -> LlmResult<String> {
        let mut attempt = 0;
        loop {
            if let Err(retry_after) = self.breaker.allow_request() {
                return Err(LlmError::CircuitOpen {
                    name: self.breaker.name().to_string(),
                    retry_after,
                });
            }

            match self.inner.chat(system, user).await {
                Ok(text) => {
                    self.breaker.record_success();
                    if attempt > 0 {
                        info!("Completion succeeded after {} retries", attempt);
                    }
                    return Ok(text);
                }
                Err(e) => {
                    if counts_against_breaker(&e) {
                        self.breaker.record_failure();
                    }
                    if !e.is_retryable() || attempt >= self.max_retries {
                        warn!("Completion failed after {} attempt(s): {}", attempt + 1, e);
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Completion failed ({}), retrying {}/{} in {:?}",
                        e, attempt, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
