//! Retrying invoker: exponential backoff with jitter around one provider.
//!
//! ```text
//! attempt 0 ─ call ─┬─ ok ──────────────────────────────► text
//!                   ├─ terminal (auth, malformed, 4xx) ─► error
//!                   └─ retryable ─ sleep delay(0) ─ attempt 1 ─ ...
//! ```
//!
//! `delay(k) = min(initial · 2^k, cap)` randomised by ±`jitter`, then clamped
//! to `[floor, cap]`. Attempts never exceed `max_attempts`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::{GenerationRequest, ProviderError};
use crate::registry::RegisteredProvider;

/// Backoff and attempt limits for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Relative jitter; 0.5 means ±50 %.
    pub jitter: f64,
    pub min_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 32_000,
            jitter: 0.5,
            min_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn floor(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms.min(self.max_delay_ms))
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Un-jittered delay after failed attempt `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let unit = rand::rng().random_range(-1.0..=1.0);
        self.delay_with_unit(attempt, unit)
    }

    /// Deterministic core of [`delay_for`](Self::delay_for); `unit` ∈ [-1, 1].
    pub fn delay_with_unit(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jittered = base + base * self.jitter * unit.clamp(-1.0, 1.0);
        let floor = self.floor().as_secs_f64();
        let cap = self.cap().as_secs_f64();
        Duration::from_secs_f64(jittered.clamp(floor, cap.max(floor)))
    }
}

/// Per-invocation bookkeeping, owned by a single call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryState {
    /// Attempts actually made.
    pub attempts: u32,
    /// Delays slept between attempts, in order.
    pub delays: Vec<Duration>,
}

impl RetryState {
    pub fn last_delay(&self) -> Option<Duration> {
        self.delays.last().copied()
    }

    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// Wraps single provider calls with classification-driven retries.
#[derive(Debug, Clone, Default)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same backoff, different attempt limit.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            policy: self.policy.clone().with_max_attempts(max_attempts),
        }
    }

    pub async fn invoke(
        &self,
        provider: &RegisteredProvider,
        request: &GenerationRequest,
    ) -> Result<String, ProviderError> {
        self.invoke_traced(provider, request).await.0
    }

    /// Invoke and also return the attempts and delays that were spent.
    pub async fn invoke_traced(
        &self,
        provider: &RegisteredProvider,
        request: &GenerationRequest,
    ) -> (Result<String, ProviderError>, RetryState) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut state = RetryState::default();
        let mut last_error: Option<ProviderError> = None;

        loop {
            if let Some(err) = &last_error {
                let mut delay = self.policy.delay_for(state.attempts - 1);
                if let Some(hint) = err.retry_after() {
                    delay = delay.max(hint.min(self.policy.cap()));
                }
                debug!(
                    provider = provider.id(),
                    attempt = state.attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                state.delays.push(delay);
                tokio::time::sleep(delay).await;
            }

            state.attempts += 1;
            let outcome = match tokio::time::timeout(request.timeout, provider.client.generate(request)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(provider.id(), request.timeout)),
            };

            match outcome {
                Ok(text) => {
                    if state.attempts > 1 {
                        debug!(provider = provider.id(), attempts = state.attempts, "Succeeded after retry");
                    }
                    return (Ok(text), state);
                }
                Err(err) if err.is_retryable() && state.attempts < max_attempts => {
                    warn!(
                        provider = provider.id(),
                        attempt = state.attempts,
                        max_attempts,
                        category = %err.retry_category(),
                        "Retryable provider failure: {}",
                        err
                    );
                    last_error = Some(err);
                }
                Err(err) => {
                    warn!(
                        provider = provider.id(),
                        attempts = state.attempts,
                        retryable = err.is_retryable(),
                        "Provider call abandoned: {}",
                        err
                    );
                    return (Err(err), state);
                }
            }
        }
    }
}
