//! HTTP request handlers.

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::server::{AppState, RequestId};
use crate::dispatch::{format_retries_header, DispatchError, FailureClass};
use crate::error::Error;
use crate::normalize::Extraction;
use crate::prompt::Language;

/// Response header: correlation ID (UUID v4).
pub const GENRELAY_REQUEST_ID_HEADER: &str = "x-genrelay-request-id";
/// Response header: wall-clock latency in milliseconds (integer).
pub const GENRELAY_LATENCY_MS_HEADER: &str = "x-genrelay-latency-ms";
/// Response header: backend that produced the answer.
pub const GENRELAY_BACKEND_HEADER: &str = "x-genrelay-backend";
/// Response header: failed attempts per backend, e.g. "2/alpha, 1/beta".
pub const GENRELAY_RETRIES_HEADER: &str = "x-genrelay-retries";

/// Body of `POST /generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub inputs: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Body returned by `POST /generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateResponse {
    pub generated_text: String,
    /// Fallback code when `generated_text` is a canned message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<&'static str>,
}

impl GenerateResponse {
    fn from_extraction(output: Extraction, language: Language) -> Self {
        match output {
            Extraction::Text(text) => Self {
                generated_text: text,
                fallback: None,
            },
            Extraction::Fallback(token) => Self {
                generated_text: token.message(language).to_string(),
                fallback: Some(token.code()),
            },
        }
    }
}

/// Outcome of `POST /warmup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupStatus {
    Success,
    /// Every backend was still loading.
    Pending,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupResponse {
    pub status: WarmupStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Check `inputs` and return it trimmed.
pub fn validate_inputs(inputs: &str, max_chars: usize) -> Result<&str, Error> {
    let trimmed = inputs.trim();
    if trimmed.is_empty() {
        return Err(Error::BadRequest("'inputs' must not be empty".to_string()));
    }
    let chars = trimmed.chars().count();
    if chars > max_chars {
        return Err(Error::BadRequest(format!(
            "'inputs' is {} characters, the limit is {}",
            chars, max_chars
        )));
    }
    Ok(trimmed)
}

/// Attach genrelay metadata headers to a response.
fn attach_genrelay_headers(
    response: &mut Response,
    request_id: &str,
    latency_ms: u64,
    backend: Option<&str>,
    retries: Option<String>,
) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(GENRELAY_REQUEST_ID_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(GENRELAY_LATENCY_MS_HEADER),
        HeaderValue::from(latency_ms),
    );
    if let Some(value) = backend.and_then(|b| HeaderValue::from_str(b).ok()) {
        headers.insert(HeaderName::from_static(GENRELAY_BACKEND_HEADER), value);
    }
    if let Some(value) = retries.and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(HeaderName::from_static(GENRELAY_RETRIES_HEADER), value);
    }
}

/// Handle POST /generate
pub async fn generate(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    let start = std::time::Instant::now();
    let correlation_id = request_id.0.to_string();

    let outcome = async {
        let Json(request) = payload.map_err(|e| Error::BadRequest(e.body_text()))?;
        let inputs = validate_inputs(&request.inputs, state.config.server.max_input_chars)?;
        let language = Language::from_tag(request.language.as_deref());
        let result = state.engine.generate(inputs, language).await?;
        Ok::<_, Error>((result, language))
    }
    .await;

    let latency_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok((result, language)) => {
            let retries = format_retries_header(&result.failed_attempts);
            let backend = result.backend_used.clone();
            let body = GenerateResponse::from_extraction(result.output, language);
            tracing::info!(
                request_id = %correlation_id,
                backend = backend.as_deref().unwrap_or("-"),
                fallback = body.fallback.unwrap_or("-"),
                latency_ms,
                "generate completed"
            );
            let mut response = Json(body).into_response();
            attach_genrelay_headers(
                &mut response,
                &correlation_id,
                latency_ms,
                backend.as_deref(),
                retries,
            );
            response
        }
        Err(error) => {
            tracing::warn!(
                request_id = %correlation_id,
                error = %error,
                latency_ms,
                "generate failed"
            );
            let mut response = error.into_response();
            attach_genrelay_headers(&mut response, &correlation_id, latency_ms, None, None);
            response
        }
    }
}

/// Handle GET /status
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status())
}

/// Handle POST /warmup
pub async fn warmup(State(state): State<AppState>) -> Json<WarmupResponse> {
    let prompt = &state.config.warmup.prompt;
    let response = match state.engine.dispatch(prompt, Language::English).await {
        Ok(result) => WarmupResponse {
            status: WarmupStatus::Success,
            backend: result.backend_used,
            message: None,
        },
        Err(DispatchError::Exhausted {
            last_failure: Some(FailureClass::Busy),
            ..
        }) => WarmupResponse {
            status: WarmupStatus::Pending,
            backend: None,
            message: Some("Backends are still loading, try again shortly".to_string()),
        },
        Err(e) => WarmupResponse {
            status: WarmupStatus::Error,
            backend: None,
            message: Some(e.to_string()),
        },
    };
    tracing::info!(status = ?response.status, backend = ?response.backend, "warm-up finished");
    Json(response)
}

/// Handle GET /backends
pub async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    let backends: Vec<serde_json::Value> = state
        .engine
        .catalog()
        .iter()
        .map(|b| {
            serde_json::json!({
                "id": b.id,
                "priority_rank": b.priority_rank,
                "template": b.template.as_str(),
                "extraction": b.extraction.as_str(),
                "parameters": b.parameters,
            })
        })
        .collect();

    Json(serde_json::json!({
        "backends": backends
    }))
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "genrelay"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::FallbackToken;

    #[test]
    fn test_validate_inputs() {
        assert_eq!(validate_inputs("  hi  ", 10).unwrap(), "hi");
        assert!(validate_inputs("   ", 10).is_err());
        assert!(validate_inputs("", 10).is_err());
        assert!(validate_inputs(&"x".repeat(11), 10).is_err());
        assert!(validate_inputs(&"x".repeat(10), 10).is_ok());
        // Limit counts characters, not bytes
        assert!(validate_inputs(&"ñ".repeat(10), 10).is_ok());
    }

    #[test]
    fn test_fallback_response_is_localized() {
        let body = GenerateResponse::from_extraction(
            Extraction::Fallback(FallbackToken::ServiceUnavailable),
            Language::Spanish,
        );
        assert_eq!(body.fallback, Some("service_unavailable"));
        assert_eq!(
            body.generated_text,
            FallbackToken::ServiceUnavailable.message(Language::Spanish)
        );

        let json = serde_json::to_value(GenerateResponse::from_extraction(
            Extraction::Text("hello world".into()),
            Language::English,
        ))
        .unwrap();
        assert_eq!(json, serde_json::json!({ "generated_text": "hello world" }));
    }

    #[test]
    fn test_warmup_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(WarmupStatus::Pending).unwrap(),
            serde_json::json!("pending")
        );
    }
}
