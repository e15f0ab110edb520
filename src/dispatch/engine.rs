//! The dispatch engine: bounded search over (backend × attempt).
//!
//! For each backend in catalog order the engine formats the prompt, calls the
//! transport under a growing per-attempt timeout and reacts to the failure
//! class:
//! - Busy: exponential backoff, retry the same backend up to its cap
//! - Timeout: fail over immediately
//! - Other: short pause, fail over
//!
//! Every failure feeds the global [`FailureTracker`]; reaching the threshold
//! triggers the [`RecoveryProbe`] in the background.

use std::sync::Arc;
use std::time::Duration;

use super::recovery::{RecoveryProbe, RecoverySettings};
use super::retry::{classify, AttemptRecord, DispatchAttempt, FailureClass, RetryPolicy};
use super::state::{FailureSnapshot, FailureTracker};
use super::transport::{BackendError, BackendRequest, Transport};
use crate::catalog::BackendCatalog;
use crate::config::{ApiKey, Config};
use crate::normalize::{Extraction, FallbackToken, ResponseNormalizer};
use crate::prompt::{self, Language};

/// Successful (possibly degraded) outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedResult {
    pub output: Extraction,
    /// Backend that produced the output; `None` when the catalog was exhausted.
    pub backend_used: Option<String>,
    /// Failed attempts before the output was produced.
    pub failed_attempts: Vec<AttemptRecord>,
}

impl NormalizedResult {
    /// The service-unavailable fallback returned when every backend failed.
    pub fn degraded(failed_attempts: Vec<AttemptRecord>) -> Self {
        Self {
            output: Extraction::Fallback(FallbackToken::ServiceUnavailable),
            backend_used: None,
            failed_attempts,
        }
    }
}

/// Errors that leave the engine. Busy and timeout failures are absorbed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("No upstream credential configured")]
    MissingCredential,

    #[error("All {backends} backends failed after {} attempts", .attempts.len())]
    Exhausted {
        backends: usize,
        attempts: Vec<AttemptRecord>,
        last_failure: Option<FailureClass>,
    },
}

/// Walks the catalog for every generation request.
pub struct DispatchEngine {
    catalog: Arc<BackendCatalog>,
    transport: Arc<dyn Transport>,
    normalizer: ResponseNormalizer,
    policy: RetryPolicy,
    credential: Option<ApiKey>,
    failures: Arc<FailureTracker>,
    recovery: Arc<RecoveryProbe>,
}

impl DispatchEngine {
    pub fn new(
        catalog: BackendCatalog,
        transport: Arc<dyn Transport>,
        normalizer: ResponseNormalizer,
        policy: RetryPolicy,
        recovery: RecoverySettings,
        credential: Option<ApiKey>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let failures = Arc::new(FailureTracker::new(policy.failure_threshold));
        let recovery = Arc::new(RecoveryProbe::new(
            catalog.clone(),
            transport.clone(),
            failures.clone(),
            credential.clone(),
            recovery,
        ));
        Self {
            catalog,
            transport,
            normalizer,
            policy,
            credential,
            failures,
            recovery,
        }
    }

    /// Build an engine from configuration around `transport`.
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            BackendCatalog::from_config(&config.backends),
            transport,
            ResponseNormalizer::new(config.normalizer.min_viable_chars),
            RetryPolicy::from_config(&config.dispatch),
            RecoverySettings::from_config(&config.recovery),
            config.upstream.api_key.clone(),
        )
    }

    pub fn catalog(&self) -> &BackendCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn failures(&self) -> &Arc<FailureTracker> {
        &self.failures
    }

    pub fn recovery(&self) -> &Arc<RecoveryProbe> {
        &self.recovery
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    pub fn status(&self) -> FailureSnapshot {
        self.failures.snapshot()
    }

    /// Cancel background recovery work.
    pub fn shutdown(&self) {
        self.recovery.shutdown();
    }

    /// Dispatch `raw_input`, converting exhaustion into the degraded result.
    pub async fn generate(
        &self,
        raw_input: &str,
        language: Language,
    ) -> Result<NormalizedResult, DispatchError> {
        match self.dispatch(raw_input, language).await {
            Err(DispatchError::Exhausted { attempts, .. }) => {
                Ok(NormalizedResult::degraded(attempts))
            }
            other => other,
        }
    }

    /// Run the bounded retry/failover search for one request.
    pub async fn dispatch(
        &self,
        raw_input: &str,
        language: Language,
    ) -> Result<NormalizedResult, DispatchError> {
        let Some(credential) = self.credential.as_ref() else {
            tracing::error!("dispatch refused: no upstream credential configured");
            return Err(DispatchError::MissingCredential);
        };

        let question = prompt::extract_question(raw_input);
        let mut failed: Vec<AttemptRecord> = Vec::new();
        let mut waited = Duration::ZERO;

        let mut backend_index = 0;
        while let Some(backend) = self.catalog.get(backend_index) {
            let formatted = prompt::format(raw_input, backend, language);
            let mut attempt_index = 0;

            loop {
                let attempt = DispatchAttempt {
                    backend: backend.id.clone(),
                    attempt_index,
                    waited,
                    timeout: self.policy.attempt_timeout(attempt_index),
                };
                tracing::debug!(
                    backend = %attempt.backend,
                    attempt = attempt.attempt_index + 1,
                    waited_ms = attempt.waited.as_millis() as u64,
                    timeout_ms = attempt.timeout.as_millis() as u64,
                    "dispatching to backend",
                );

                let request = BackendRequest {
                    backend_id: &backend.id,
                    prompt: &formatted,
                    parameters: &backend.parameters,
                    timeout: attempt.timeout,
                    credential,
                };
                let result =
                    match tokio::time::timeout(attempt.timeout, self.transport.generate(request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(BackendError::Timeout {
                            backend: backend.id.clone(),
                            timeout_ms: attempt.timeout.as_millis() as u64,
                        }),
                    };

                let error = match result {
                    Ok(payload) => {
                        let output = self.normalizer.extract_for(&payload, backend, Some(&question));
                        self.failures.record_success(&backend.id);
                        if !failed.is_empty() {
                            tracing::info!(
                                backend = %backend.id,
                                failed_attempts = failed.len(),
                                "dispatch succeeded after failures",
                            );
                        }
                        return Ok(NormalizedResult {
                            output,
                            backend_used: Some(backend.id.clone()),
                            failed_attempts: failed,
                        });
                    }
                    Err(error) => error,
                };

                let class = classify(&error);
                tracing::warn!(
                    backend = %backend.id,
                    attempt = attempt_index + 1,
                    class = class.as_str(),
                    error = %error,
                    "backend attempt failed",
                );
                failed.push(AttemptRecord {
                    backend: backend.id.clone(),
                    class,
                });

                let outcome = self.failures.record_failure(&backend.id, class);
                if outcome.threshold_reached && self.recovery.trigger() {
                    tracing::warn!(
                        consecutive_failures = outcome.consecutive_failures,
                        "failure threshold reached, recovery probe started",
                    );
                }

                match class {
                    FailureClass::Busy if self.policy.should_retry_busy(attempt_index) => {
                        waited = self.policy.backoff_delay(attempt_index);
                        tokio::time::sleep(waited).await;
                        attempt_index += 1;
                    }
                    FailureClass::Busy | FailureClass::Timeout => {
                        waited = Duration::ZERO;
                        break;
                    }
                    FailureClass::Other => {
                        waited = Duration::ZERO;
                        if backend_index + 1 < self.catalog.len() {
                            waited = self.policy.failover_delay;
                            tokio::time::sleep(waited).await;
                        }
                        break;
                    }
                }
            }

            backend_index += 1;
        }

        let last_failure = failed.last().map(|a| a.class);
        tracing::error!(
            backends = self.catalog.len(),
            attempts = failed.len(),
            "all backends failed",
        );
        Err(DispatchError::Exhausted {
            backends: self.catalog.len(),
            attempts: failed,
            last_failure,
        })
    }
}
