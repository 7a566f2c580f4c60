//! Retry scheduling with exponential backoff and full jitter.
//!
//! Every component that owns a network endpoint holds its own [`RetryPolicy`]
//! instance; the schedules are fixed per component (connector: 1s base capped
//! at 60s, store writers: 250ms base capped at 30s). Jitter draws the actual
//! delay uniformly from `[0, computed]` to avoid reconnect herds.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Draw the actual delay uniformly from `[0, computed]`.
    pub full_jitter: bool,
}

impl RetryPolicy {
    /// Schedule used by the source connector: 1s base, factor 2, 60s cap.
    pub fn connector() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            full_jitter: true,
        }
    }

    /// Schedule shared by the batch writer and the metadata synchronizer:
    /// 250ms base, factor 2, 30s cap.
    pub fn store_writes() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            full_jitter: true,
        }
    }

    /// Deterministic delay for `attempt` (0-based) before jitter.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let millis = (self.base_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32))
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Delay for `attempt` with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        if !self.full_jitter || raw.is_zero() {
            return raw;
        }
        let millis = rand::thread_rng().gen_range(0..=raw.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Stateful attempt tracker over this policy.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Tracks consecutive failures against a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay to sleep before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Number of failures observed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Call after a success so the next failure starts from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
