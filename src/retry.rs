//! Startup retry policy with capped exponential backoff and jitter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::RetrySection;
use crate::error::PwshBridgeError;

/// Decides whether and how long to wait before re-attempting an operation.
///
/// Only transient infrastructure failures are retried (see
/// [`PwshBridgeError::is_transient`]); a command that legitimately errored is
/// never re-run, since re-execution could repeat side effects. When the
/// attempt ceiling is reached the last error is surfaced unchanged.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// Create a policy with explicit parameters.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    /// Create a policy from the retry section of a session config.
    pub fn from_config(retry: &RetrySection) -> Self {
        Self::new(
            retry.max_attempts,
            retry.base_delay(),
            retry.max_delay(),
            retry.jitter_fraction,
        )
    }

    /// Maximum total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the backoff before the next attempt, recording the failed
    /// attempt in `state`.
    ///
    /// Returns `None` when `error` is not transient or the attempt ceiling
    /// has been reached; the caller then surfaces `error` unchanged.
    pub fn backoff(&self, state: &mut RetryState, error: &PwshBridgeError) -> Option<Duration> {
        if !error.is_transient() {
            return None;
        }
        state.attempts += 1;
        if state.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.jittered(self.raw_delay(state.attempts));
        state.total_backoff += delay;
        Some(delay)
    }

    /// Undithered delay before attempt `attempt + 1` (1-based failed-attempt
    /// count): `base * 2^(attempt-1)`, capped at the configured maximum.
    fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Add random jitter in `[0, jitter_fraction * delay]`.
    ///
    /// Entropy comes from the system clock's subsecond nanos; retry storms
    /// only need decorrelation, not cryptographic randomness.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_fraction <= 0.0 {
            return delay;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let unit = f64::from(nanos) / 1e9;
        delay + delay.mul_f64(self.jitter_fraction * unit)
    }

    /// Worst-case delay before attempt `attempt + 1`, jitter included.
    /// Used to budget how long a caller may wait on startup overall.
    pub(crate) fn max_delay_for(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        raw + raw.mul_f64(self.jitter_fraction)
    }
}

/// Per-operation retry bookkeeping. Lives for one logical operation only.
#[derive(Debug, Default)]
pub struct RetryState {
    attempts: u32,
    total_backoff: Duration,
}

impl RetryState {
    /// Fresh state with no attempts recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Total backoff slept across all recorded attempts.
    pub fn total_backoff(&self) -> Duration {
        self.total_backoff
    }
}
