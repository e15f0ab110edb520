//! Retry, backoff and failure classification for backend calls.
//!
//! This module holds the policy half of the dispatch algorithm:
//! - Classifying a failed call as busy, timed out, or anything else
//! - Exponential backoff for busy backends, capped
//! - Per-attempt timeouts that grow with the attempt index
//! - Attempt records and the `x-genrelay-retries` header format

use std::time::Duration;

use super::transport::{mentions_loading, BackendError};
use crate::config::DispatchConfig;

/// How the engine reacts to a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Backend is loading or overloaded: back off and retry the same backend.
    Busy,
    /// Attempt exceeded its timeout: fail over immediately.
    Timeout,
    /// Anything else: fail over after a short pause.
    Other,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Busy => "busy",
            FailureClass::Timeout => "timeout",
            FailureClass::Other => "other",
        }
    }
}

/// Classify a backend error.
///
/// 503 and anything that mentions the model loading is `Busy`.
pub fn classify(error: &BackendError) -> FailureClass {
    match error {
        BackendError::Loading { .. } => FailureClass::Busy,
        BackendError::Timeout { .. } => FailureClass::Timeout,
        BackendError::Status { status: 503, .. } => FailureClass::Busy,
        BackendError::Status { body, .. } if mentions_loading(body) => FailureClass::Busy,
        BackendError::Upstream { message, .. } if mentions_loading(message) => FailureClass::Busy,
        BackendError::Status { .. }
        | BackendError::Network { .. }
        | BackendError::Malformed { .. }
        | BackendError::Upstream { .. } => FailureClass::Other,
    }
}

/// Timing and bounds for one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_timeout: Duration,
    pub timeout_increment: Duration,
    pub max_attempts_per_backend: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub failover_delay: Duration,
    pub failure_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            base_timeout: Duration::from_millis(config.base_timeout_ms),
            timeout_increment: Duration::from_millis(config.timeout_increment_ms),
            max_attempts_per_backend: config.max_attempts_per_backend.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            failover_delay: Duration::from_millis(config.failover_delay_ms),
            failure_threshold: config.failure_threshold.max(1),
        }
    }

    /// Timeout for attempt `attempt_index` (0-based) against one backend.
    pub fn attempt_timeout(&self, attempt_index: u32) -> Duration {
        self.base_timeout + self.timeout_increment.saturating_mul(attempt_index)
    }

    /// Wait after busy attempt `attempt_index` failed: `base × 2^attempt`, capped.
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt_index))
            .min(self.backoff_cap)
    }

    /// Whether a busy backend gets another attempt after `attempt_index` failed.
    pub fn should_retry_busy(&self, attempt_index: u32) -> bool {
        attempt_index + 1 < self.max_attempts_per_backend
    }

    /// Upper bound on network calls one dispatch makes against `backends` backends.
    pub fn max_calls(&self, backends: usize) -> usize {
        backends * self.max_attempts_per_backend as usize
    }
}

/// One network call as the engine planned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAttempt {
    pub backend: String,
    pub attempt_index: u32,
    /// Wait between the previous attempt and this one.
    pub waited: Duration,
    pub timeout: Duration,
}

/// Record of a single failed attempt, for logs and the retries header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub backend: String,
    pub class: FailureClass,
}

/// Format attempt records into the `x-genrelay-retries` header value.
///
/// Format: `"2/backend-alpha, 1/backend-beta"` -- count of failed attempts
/// per backend, preserving first-appearance order.
///
/// Returns `None` if the attempts slice is empty (no retries occurred).
pub fn format_retries_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        if let Some(entry) = counts.iter_mut().find(|(name, _)| *name == attempt.backend) {
            entry.1 += 1;
        } else {
            counts.push((&attempt.backend, 1));
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}
