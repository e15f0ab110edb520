//! Process-wide dispatch failure accounting.
//!
//! [`FailureTracker`] owns the global failure state shared by every dispatch
//! call and the recovery probe:
//! - Consecutive failure count, reset by any successful attempt
//! - The backend that most recently answered
//! - Recovery sweep counter
//!
//! The lock is never held across an `.await`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::retry::FailureClass;

/// Mutable failure state (not thread-safe on its own).
#[derive(Debug, Clone, Default)]
pub(crate) struct GlobalFailureState {
    pub(crate) consecutive_failures: u32,
    pub(crate) current_backend: Option<String>,
    pub(crate) last_failure_at: Option<DateTime<Utc>>,
    pub(crate) last_failure_class: Option<FailureClass>,
    pub(crate) recovery_attempts: u32,
    /// Set by any success, cleared once failures reach the threshold.
    pub(crate) ready: bool,
}

/// Point-in-time copy of the failure state, as reported by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSnapshot {
    pub current_backend: Option<String>,
    pub is_ready: bool,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// What recording a failure did to the global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub consecutive_failures: u32,
    /// The count is at or above the recovery threshold.
    pub threshold_reached: bool,
}

/// Whether a recovery sweep may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPermit {
    /// Sweep number `n` (1-based since the last cooldown) may proceed.
    Proceed(u32),
    /// Too many sweeps; the counter was reset and the probe should cool down.
    CoolDown,
}

/// Lock-guarded [`GlobalFailureState`] shared by `Arc`.
#[derive(Debug)]
pub struct FailureTracker {
    inner: Mutex<GlobalFailureState>,
    threshold: u32,
}

impl FailureTracker {
    /// Create a tracker that reports `threshold_reached` at `threshold` failures.
    pub fn new(threshold: u32) -> Self {
        Self {
            inner: Mutex::new(GlobalFailureState::default()),
            threshold: threshold.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalFailureState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A dispatch attempt against `backend` succeeded.
    pub fn record_success(&self, backend: &str) {
        let mut state = self.lock();
        if state.consecutive_failures > 0 {
            tracing::info!(
                backend = %backend,
                cleared_failures = state.consecutive_failures,
                "dispatch recovered: failure count reset",
            );
        }
        state.consecutive_failures = 0;
        state.current_backend = Some(backend.to_string());
        state.ready = true;
    }

    /// A dispatch attempt against `backend` failed with `class`.
    pub fn record_failure(&self, backend: &str, class: FailureClass) -> FailureOutcome {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(Utc::now());
        state.last_failure_class = Some(class);

        let threshold_reached = state.consecutive_failures >= self.threshold;
        if threshold_reached && state.ready {
            state.ready = false;
            tracing::warn!(
                backend = %backend,
                consecutive_failures = state.consecutive_failures,
                "dispatch degraded: {} consecutive failures",
                state.consecutive_failures,
            );
        }

        FailureOutcome {
            consecutive_failures: state.consecutive_failures,
            threshold_reached,
        }
    }

    /// Account for a recovery sweep about to start.
    ///
    /// Once the sweep counter exceeds `max_attempts` it is reset and the
    /// caller is told to cool down instead.
    pub fn begin_recovery_sweep(&self, max_attempts: u32) -> SweepPermit {
        let mut state = self.lock();
        if state.recovery_attempts > max_attempts {
            state.recovery_attempts = 0;
            SweepPermit::CoolDown
        } else {
            state.recovery_attempts += 1;
            SweepPermit::Proceed(state.recovery_attempts)
        }
    }

    /// A recovery health check against `backend` succeeded.
    pub fn record_recovery(&self, backend: &str) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.recovery_attempts = 0;
        state.current_backend = Some(backend.to_string());
        state.ready = true;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn current_backend(&self) -> Option<String> {
        self.lock().current_backend.clone()
    }

    pub fn last_failure_class(&self) -> Option<FailureClass> {
        self.lock().last_failure_class
    }

    pub fn snapshot(&self) -> FailureSnapshot {
        let state = self.lock();
        FailureSnapshot {
            current_backend: state.current_backend.clone(),
            is_ready: state.ready,
            consecutive_failures: state.consecutive_failures,
            recovery_attempts: state.recovery_attempts,
            last_failure_at: state.last_failure_at,
        }
    }
}
