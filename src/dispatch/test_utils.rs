//! Scripted transport and catalog helpers for dispatch tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::transport::{BackendError, BackendRequest, Transport};
use crate::catalog::{
    BackendCatalog, BackendDescriptor, ExtractionKind, GenerationParameters, TemplateKind,
};

/// What a scripted backend does on one call.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// `[{"generated_text": ...}]`
    Text(&'static str),
    /// "currently loading" (busy)
    Loading,
    /// Never answers; the engine's timeout fires.
    Hang,
    /// Non-success HTTP status.
    Status(u16),
}

/// One recorded call.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) backend: String,
    pub(crate) prompt: String,
    pub(crate) timeout: Duration,
    pub(crate) at: tokio::time::Instant,
}

#[derive(Debug)]
struct Script {
    queue: VecDeque<Reply>,
    fallback: Reply,
}

/// Transport whose backends follow a per-backend script.
///
/// Each backend replays its queued replies in order, then repeats the last one.
/// Backends without a script fail with a 404 status.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn always(self, backend: &str, reply: Reply) -> Self {
        self.sequence(backend, vec![reply])
    }

    pub(crate) fn sequence(self, backend: &str, replies: Vec<Reply>) -> Self {
        let fallback = replies.last().cloned().unwrap_or(Reply::Status(404));
        self.scripts.lock().unwrap().insert(
            backend.to_string(),
            Script {
                queue: replies.into(),
                fallback,
            },
        );
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, backend: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.backend == backend)
            .collect()
    }

    fn next_reply(&self, backend: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(backend) {
            Some(script) => script
                .queue
                .pop_front()
                .unwrap_or_else(|| script.fallback.clone()),
            None => Reply::Status(404),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn generate(&self, request: BackendRequest<'_>) -> Result<Value, BackendError> {
        self.calls.lock().unwrap().push(Call {
            backend: request.backend_id.to_string(),
            prompt: request.prompt.to_string(),
            timeout: request.timeout,
            at: tokio::time::Instant::now(),
        });

        let backend = request.backend_id.to_string();
        match self.next_reply(&backend) {
            Reply::Text(text) => Ok(json!([{ "generated_text": text }])),
            Reply::Loading => Err(BackendError::Loading {
                message: format!("Model {} is currently loading", backend),
                backend,
            }),
            Reply::Hang => std::future::pending().await,
            Reply::Status(status) => Err(BackendError::Status {
                backend,
                status,
                body: "scripted failure".to_string(),
            }),
        }
    }
}

/// Catalog of plain generic backends with the given identifiers.
pub(crate) fn catalog_of(ids: &[&str]) -> BackendCatalog {
    BackendCatalog::new(
        ids.iter()
            .map(|id| {
                BackendDescriptor::new(
                    *id,
                    TemplateKind::Generic,
                    ExtractionKind::AnswerPrefix,
                    GenerationParameters::default(),
                )
            })
            .collect(),
    )
}
