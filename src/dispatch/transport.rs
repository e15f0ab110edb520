//! Network seam between the dispatch engine and hosted backends.
//!
//! [`Transport`] performs exactly one call to one backend. The engine owns
//! retry, timeout and failover policy; implementations only report what
//! happened on the wire.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::catalog::GenerationParameters;
use crate::config::ApiKey;

/// Everything a transport needs for one backend call.
#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub backend_id: &'a str,
    pub prompt: &'a str,
    pub parameters: &'a GenerationParameters,
    pub timeout: Duration,
    pub credential: &'a ApiKey,
}

/// Failure of a single backend call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Backend '{backend}' is loading: {message}")]
    Loading { backend: String, message: String },

    #[error("Backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("Backend '{backend}' returned {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("Failed to reach backend '{backend}': {message}")]
    Network { backend: String, message: String },

    #[error("Malformed response from backend '{backend}': {message}")]
    Malformed { backend: String, message: String },

    #[error("Backend '{backend}' reported an error: {message}")]
    Upstream { backend: String, message: String },
}

/// One network call to one backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the backend's raw payload.
    async fn generate(&self, request: BackendRequest<'_>) -> Result<Value, BackendError>;
}

/// Whether backend text says the model is still being loaded.
pub fn mentions_loading(text: &str) -> bool {
    text.to_ascii_lowercase().contains("loading")
}

/// Pull the `error` message out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// [`Transport`] for hosted inference endpoints at `{base_url}/models/{id}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport with its own connection pool.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, backend_id: &str) -> String {
        format!("{}/models/{}", self.base_url.trim_end_matches('/'), backend_id)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn generate(&self, request: BackendRequest<'_>) -> Result<Value, BackendError> {
        let backend = request.backend_id.to_string();
        let body = serde_json::json!({
            "inputs": request.prompt,
            "parameters": {
                "max_new_tokens": request.parameters.max_new_tokens,
                "temperature": request.parameters.temperature,
                "top_p": request.parameters.top_p,
                "do_sample": request.parameters.do_sample,
                "return_full_text": false,
            },
            "options": {
                "wait_for_model": false,
                "use_cache": false,
            },
        });

        let response = self
            .client
            .post(self.endpoint(request.backend_id))
            .bearer_auth(request.credential.expose_secret())
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout {
                        backend: backend.clone(),
                        timeout_ms: request.timeout.as_millis() as u64,
                    }
                } else {
                    BackendError::Network {
                        backend: backend.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout {
                    backend: backend.clone(),
                    timeout_ms: request.timeout.as_millis() as u64,
                }
            } else {
                BackendError::Malformed {
                    backend: backend.clone(),
                    message: format!("Failed to read response body: {}", e),
                }
            }
        })?;

        if !status.is_success() {
            if status == reqwest::StatusCode::SERVICE_UNAVAILABLE || mentions_loading(&text) {
                return Err(BackendError::Loading {
                    backend,
                    message: error_message(&text),
                });
            }
            return Err(BackendError::Status {
                backend,
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) if map.contains_key("error") => {
                let message = map
                    .get("error")
                    .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                    .unwrap_or_default();
                if mentions_loading(&message) {
                    Err(BackendError::Loading { backend, message })
                } else {
                    Err(BackendError::Upstream { backend, message })
                }
            }
            Ok(value) => Ok(value),
            // Some backends answer with plain text.
            Err(_) => Ok(Value::String(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mentions_loading() {
        assert!(mentions_loading("Model gpt2 is currently loading"));
        assert!(mentions_loading("LOADING"));
        assert!(!mentions_loading("Internal Server Error"));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":"Model x is currently loading","estimated_time":20.0}"#),
            "Model x is currently loading"
        );
        assert_eq!(error_message("  plain failure \n"), "plain failure");
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let transport = HttpTransport::with_client(reqwest::Client::new(), "http://host:1/");
        assert_eq!(
            transport.endpoint("org/model-7b"),
            "http://host:1/models/org/model-7b"
        );
    }
}
