//! Background recovery probe.
//!
//! Triggered when consecutive dispatch failures reach the threshold. A sweep
//! health-checks every backend in catalog order with a trivial prompt; the
//! first one that answers becomes the current backend and the global failure
//! state is reset.
//!
//! The probe is single-flight: a run that starts while another is in progress
//! returns immediately. After too many fruitless sweeps it schedules one
//! follow-up run after a cooldown; that scheduled task is owned by the probe
//! and cancelled by [`RecoveryProbe::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::state::{FailureTracker, SweepPermit};
use super::transport::{BackendError, BackendRequest, Transport};
use crate::catalog::{BackendCatalog, GenerationParameters};
use crate::config::{ApiKey, RecoveryConfig};

/// Tuning for recovery sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySettings {
    /// Sweeps allowed before cooling down (cooldown once the count exceeds this).
    pub max_sweeps: u32,
    pub cooldown: Duration,
    pub probe_timeout: Duration,
    pub probe_prompt: String,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl RecoverySettings {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_sweeps: config.max_sweeps,
            cooldown: Duration::from_millis(config.cooldown_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            probe_prompt: config.probe_prompt.clone(),
        }
    }
}

/// How a call to [`RecoveryProbe::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// This backend answered; global failure state was reset.
    Recovered(String),
    /// No backend answered; global failure state is unchanged.
    NoHealthyBackend,
    /// Too many sweeps; a follow-up run is scheduled after the cooldown.
    CoolingDown,
    /// Another run is in progress, or a cooldown is pending.
    AlreadyRunning,
    /// No credential, so no backend can be checked.
    MissingCredential,
    ShutDown,
}

/// Clears the running flag when a sweep ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Single-flight background health sweep over the catalog.
pub struct RecoveryProbe {
    catalog: Arc<BackendCatalog>,
    transport: Arc<dyn Transport>,
    failures: Arc<FailureTracker>,
    credential: Option<ApiKey>,
    settings: RecoverySettings,
    running: AtomicBool,
    cooldown_pending: AtomicBool,
    shut_down: AtomicBool,
    scheduled: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryProbe {
    pub fn new(
        catalog: Arc<BackendCatalog>,
        transport: Arc<dyn Transport>,
        failures: Arc<FailureTracker>,
        credential: Option<ApiKey>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            catalog,
            transport,
            failures,
            credential,
            settings,
            running: AtomicBool::new(false),
            cooldown_pending: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            scheduled: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_cooling_down(&self) -> bool {
        self.cooldown_pending.load(Ordering::Acquire)
    }

    /// Start a sweep in the background unless one is running or cooling down.
    ///
    /// Returns whether a task was spawned. Must be called inside a tokio runtime.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.is_running() || self.is_cooling_down() || self.shut_down.load(Ordering::Acquire)
        {
            return false;
        }
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = probe.run().await;
            tracing::debug!(outcome = ?outcome, "recovery probe finished");
        });
        true
    }

    /// Run one sweep now.
    pub async fn run(self: &Arc<Self>) -> ProbeOutcome {
        if self.shut_down.load(Ordering::Acquire) {
            return ProbeOutcome::ShutDown;
        }
        if self.is_cooling_down() {
            return ProbeOutcome::AlreadyRunning;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ProbeOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);

        let Some(credential) = self.credential.as_ref() else {
            tracing::warn!("recovery probe skipped: no upstream credential configured");
            return ProbeOutcome::MissingCredential;
        };

        let sweep = match self.failures.begin_recovery_sweep(self.settings.max_sweeps) {
            SweepPermit::Proceed(sweep) => sweep,
            SweepPermit::CoolDown => {
                tracing::warn!(
                    cooldown_ms = self.settings.cooldown.as_millis() as u64,
                    "recovery probe exhausted its sweeps, cooling down",
                );
                self.schedule_after_cooldown();
                return ProbeOutcome::CoolingDown;
            }
        };

        tracing::info!(
            sweep,
            backends = self.catalog.len(),
            "recovery probe sweeping backends"
        );

        let parameters = GenerationParameters::probe();
        for backend in self.catalog.iter() {
            let request = BackendRequest {
                backend_id: &backend.id,
                prompt: &self.settings.probe_prompt,
                parameters: &parameters,
                timeout: self.settings.probe_timeout,
                credential,
            };
            let result =
                match tokio::time::timeout(self.settings.probe_timeout, self.transport.generate(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout {
                        backend: backend.id.clone(),
                        timeout_ms: self.settings.probe_timeout.as_millis() as u64,
                    }),
                };

            match result {
                Ok(_) => {
                    self.failures.record_recovery(&backend.id);
                    tracing::info!(backend = %backend.id, sweep, "recovery probe found a healthy backend");
                    return ProbeOutcome::Recovered(backend.id.clone());
                }
                Err(e) => {
                    tracing::debug!(backend = %backend.id, error = %e, "recovery health check failed");
                }
            }
        }

        tracing::warn!(sweep, "recovery probe found no healthy backend");
        ProbeOutcome::NoHealthyBackend
    }

    fn schedule_after_cooldown(self: &Arc<Self>) {
        self.cooldown_pending.store(true, Ordering::Release);
        let probe = Arc::clone(self);
        let cooldown = self.settings.cooldown;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            probe.cooldown_pending.store(false, Ordering::Release);
            probe.trigger();
        });

        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = scheduled.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel any scheduled follow-up run and refuse further runs.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let mut scheduled = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = scheduled.take() {
            handle.abort();
        }
        self.cooldown_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::retry::FailureClass;
    use crate::dispatch::test_utils::{catalog_of, Reply, ScriptedTransport};

    fn settings() -> RecoverySettings {
        RecoverySettings {
            max_sweeps: 2,
            cooldown: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            probe_prompt: "Hello".to_string(),
        }
    }

    fn probe_with(
        ids: &[&str],
        transport: Arc<ScriptedTransport>,
        credential: Option<ApiKey>,
    ) -> (Arc<RecoveryProbe>, Arc<FailureTracker>) {
        let failures = Arc::new(FailureTracker::new(3));
        let probe = Arc::new(RecoveryProbe::new(
            Arc::new(catalog_of(ids)),
            transport,
            failures.clone(),
            credential,
            settings(),
        ));
        (probe, failures)
    }

    fn fail_n(failures: &FailureTracker, n: u32) {
        for _ in 0..n {
            failures.record_failure("x", FailureClass::Timeout);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_healthy_recovers_on_first_backend() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .always("x", Reply::Text("hi"))
                .always("y", Reply::Text("hi")),
        );
        let (probe, failures) = probe_with(&["x", "y"], transport.clone(), Some("k".into()));
        fail_n(&failures, 4);

        assert_eq!(probe.run().await, ProbeOutcome::Recovered("x".to_string()));
        let snapshot = failures.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.recovery_attempts, 0);
        assert_eq!(snapshot.current_backend.as_deref(), Some("x"));
        assert!(snapshot.is_ready);
        // Sweep stops at the first healthy backend
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(transport.calls()[0].prompt, "Hello");
        assert!(!probe.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_unhealthy_backends_in_order() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .always("x", Reply::Status(500))
                .always("y", Reply::Hang)
                .always("z", Reply::Text("hi")),
        );
        let (probe, failures) =
            probe_with(&["x", "y", "z"], transport.clone(), Some("k".into()));
        fail_n(&failures, 3);

        assert_eq!(probe.run().await, ProbeOutcome::Recovered("z".to_string()));
        assert_eq!(failures.current_backend().as_deref(), Some("z"));
        let order: Vec<_> = transport.calls().into_iter().map(|c| c.backend).collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_healthy_backend_leaves_state() {
        let transport = Arc::new(ScriptedTransport::new().always("x", Reply::Loading));
        let (probe, failures) = probe_with(&["x"], transport, Some("k".into()));
        fail_n(&failures, 3);

        assert_eq!(probe.run().await, ProbeOutcome::NoHealthyBackend);
        let snapshot = failures.snapshot();
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.recovery_attempts, 1);
        assert!(snapshot.current_backend.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_exceeding_attempts_then_reschedules() {
        let transport = Arc::new(ScriptedTransport::new().always("x", Reply::Status(500)));
        let (probe, failures) = probe_with(&["x"], transport.clone(), Some("k".into()));
        fail_n(&failures, 3);

        // max_sweeps = 2: sweeps run while the counter is 0, 1 and 2
        for _ in 0..3 {
            assert_eq!(probe.run().await, ProbeOutcome::NoHealthyBackend);
        }
        assert_eq!(transport.calls().len(), 3);

        assert_eq!(probe.run().await, ProbeOutcome::CoolingDown);
        assert_eq!(failures.snapshot().recovery_attempts, 0);
        assert!(probe.is_cooling_down());

        // Deferred: no work while cooling down
        assert_eq!(probe.run().await, ProbeOutcome::AlreadyRunning);
        assert!(!probe.trigger());
        assert_eq!(transport.calls().len(), 3);

        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!probe.is_cooling_down());
        assert_eq!(transport.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .sequence("x", vec![Reply::Hang, Reply::Text("hi")]),
        );
        let (probe, _failures) = probe_with(&["x"], transport.clone(), Some("k".into()));

        let background = {
            let probe = probe.clone();
            tokio::spawn(async move { probe.run().await })
        };
        while !probe.is_running() {
            tokio::task::yield_now().await;
        }

        assert_eq!(probe.run().await, ProbeOutcome::AlreadyRunning);
        assert!(!probe.trigger());

        assert_eq!(background.await.unwrap(), ProbeOutcome::NoHealthyBackend);
        assert!(!probe.is_running());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_is_noop() {
        let transport = Arc::new(ScriptedTransport::new().always("x", Reply::Text("hi")));
        let (probe, failures) = probe_with(&["x"], transport.clone(), None);
        fail_n(&failures, 3);

        assert_eq!(probe.run().await, ProbeOutcome::MissingCredential);
        assert!(transport.calls().is_empty());
        assert_eq!(failures.consecutive_failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_scheduled_run() {
        let transport = Arc::new(ScriptedTransport::new().always("x", Reply::Status(500)));
        let (probe, _failures) = probe_with(&["x"], transport.clone(), Some("k".into()));
        for _ in 0..3 {
            probe.run().await;
        }
        assert_eq!(probe.run().await, ProbeOutcome::CoolingDown);

        probe.shutdown();
        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.calls().len(), 3);
        assert_eq!(probe.run().await, ProbeOutcome::ShutDown);
    }
}
