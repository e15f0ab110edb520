//! Response normalization.
//!
//! Turns whatever a backend returned into clean, presentable text:
//! 1. Coerce the payload shape into one raw continuation string
//! 2. Strip backend-specific template artifacts
//! 3. Strip role labels and template echo lines
//! 4. Remove leaked instruction phrases
//! 5. Replace empty or too-short results with a fallback token
//!
//! Everything here is pure and deterministic.

use regex::Regex;
use serde_json::Value;

use crate::catalog::{BackendDescriptor, ExtractionKind};
use crate::prompt::{self, Language};

/// Default minimum length (in characters) of a usable answer.
pub const DEFAULT_MIN_VIABLE_CHARS: usize = 10;

/// User-safe replacement for an answer that could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackToken {
    /// The backend returned nothing usable.
    CouldNotGenerate,
    /// The cleaned answer was too short to be useful.
    NeedsMoreDetail,
    /// No backend could be reached.
    ServiceUnavailable,
}

impl FallbackToken {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            FallbackToken::CouldNotGenerate => "could_not_generate",
            FallbackToken::NeedsMoreDetail => "needs_more_detail",
            FallbackToken::ServiceUnavailable => "service_unavailable",
        }
    }

    /// Localized message shown to the user.
    pub fn message(&self, language: Language) -> &'static str {
        match (self, language) {
            (FallbackToken::CouldNotGenerate, Language::English) => {
                "Sorry, I could not generate an answer. Please try rephrasing your question."
            }
            (FallbackToken::CouldNotGenerate, Language::Spanish) => {
                "Lo siento, no pude generar una respuesta. Intenta reformular tu pregunta."
            }
            (FallbackToken::NeedsMoreDetail, Language::English) => {
                "Could you give me a bit more detail? I need more context to answer that well."
            }
            (FallbackToken::NeedsMoreDetail, Language::Spanish) => {
                "¿Podrías darme más detalles? Necesito más contexto para responder bien."
            }
            (FallbackToken::ServiceUnavailable, Language::English) => {
                "I'm having trouble connecting to the AI service right now. Please try again in a moment."
            }
            (FallbackToken::ServiceUnavailable, Language::Spanish) => {
                "Tengo problemas para conectarme con el servicio de IA. Inténtalo de nuevo en un momento."
            }
        }
    }
}

/// Result of normalizing one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    Fallback(FallbackToken),
}

/// Coerce a backend payload into a single raw continuation string.
///
/// Accepts `[{"generated_text": ..}]`, `{"generated_text": ..}`, `["..."]` and
/// bare strings. Any other non-empty payload is stringified as JSON.
pub fn coerce_payload(payload: &Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => match items.first() {
            None => String::new(),
            Some(first) => record_text(first).unwrap_or_else(|| payload.to_string()),
        },
        Value::Object(map) if map.is_empty() => String::new(),
        Value::Object(_) => record_text(payload).unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}

fn record_text(record: &Value) -> Option<String> {
    match record {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("generated_text")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Strip the template artifacts a backend of `kind` leaves in its output.
pub fn strip_artifacts(raw: &str, kind: ExtractionKind) -> String {
    match kind {
        ExtractionKind::InstructionMarkers => {
            let tail = match raw.rfind("[/INST]") {
                Some(pos) => &raw[pos + "[/INST]".len()..],
                None => raw,
            };
            tail.replace("<s>", "")
                .replace("</s>", "")
                .replace("[INST]", "")
                .trim()
                .to_string()
        }
        ExtractionKind::ChatRoles => {
            let tail = match raw.rfind("<|assistant|>") {
                Some(pos) => &raw[pos + "<|assistant|>".len()..],
                None => raw,
            };
            let mut text = tail.to_string();
            for marker in ["</s>", "<|system|>", "<|user|>", "<|assistant|>", "<|end|>"] {
                text = text.replace(marker, "");
            }
            text.trim().to_string()
        }
        ExtractionKind::AnswerPrefix => match strip_answer_prefix(raw) {
            Some(rest) => rest.trim().to_string(),
            None => raw.trim().to_string(),
        },
        ExtractionKind::Plain => raw.trim().to_string(),
    }
}

/// Text after a leading `Answer:` / `A:` label, if there is one.
fn strip_answer_prefix(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    ["answer:", "a:"].into_iter().find_map(|prefix| {
        let head = trimmed.get(..prefix.len())?;
        head.eq_ignore_ascii_case(prefix)
            .then(|| &trimmed[prefix.len()..])
    })
}

/// Cleans raw backend payloads into presentable text.
#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    min_viable_chars: usize,
    role_label: Regex,
    echo_line: Regex,
    leaked_phrases: Regex,
    blank_runs: Regex,
}

impl Default for ResponseNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_VIABLE_CHARS)
    }
}

impl ResponseNormalizer {
    pub fn new(min_viable_chars: usize) -> Self {
        let phrases = prompt::instruction_phrases()
            .chain(LEAKED_PHRASES.iter().copied())
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("|");

        Self {
            min_viable_chars,
            role_label: Regex::new(r"^(?i)\s*(assistant|system|bot|ai|response)\s*:\s*")
                .expect("role label pattern is valid"),
            echo_line: Regex::new(r"^(?i)\s*(q|question|user|human)\s*:")
                .expect("echo line pattern is valid"),
            leaked_phrases: Regex::new(&format!("(?i)(?:{})", phrases))
                .expect("escaped phrase alternation is valid"),
            blank_runs: Regex::new(r"\n{3,}").expect("blank run pattern is valid"),
        }
    }

    /// Normalize `payload` returned by `backend`.
    pub fn extract(&self, payload: &Value, backend: &BackendDescriptor) -> Extraction {
        self.extract_for(payload, backend, None)
    }

    /// Normalize `payload`, additionally dropping lines that repeat `question`.
    pub fn extract_for(
        &self,
        payload: &Value,
        backend: &BackendDescriptor,
        question: Option<&str>,
    ) -> Extraction {
        let raw = coerce_payload(payload);
        if raw.trim().is_empty() {
            return Extraction::Fallback(FallbackToken::CouldNotGenerate);
        }

        let stripped = strip_artifacts(&raw, backend.extraction);
        let without_echoes = self.strip_roles_and_echoes(&stripped, backend.extraction, question);
        let cleaned = self.remove_leaked_phrases(&without_echoes);
        let cleaned = cleaned.trim();

        if cleaned.chars().count() < self.min_viable_chars || cleaned.is_empty() {
            return Extraction::Fallback(FallbackToken::NeedsMoreDetail);
        }
        Extraction::Text(cleaned.to_string())
    }

    /// Drop leading role labels and template echo lines.
    ///
    /// An echo line after real content means the model started a new turn,
    /// so everything from that line on is dropped.
    fn strip_roles_and_echoes(
        &self,
        text: &str,
        kind: ExtractionKind,
        question: Option<&str>,
    ) -> String {
        let rest = self.strip_role_labels(text, kind);

        let question = question.map(|q| prompt::extract_question(q).to_lowercase());
        let mut kept: Vec<&str> = Vec::new();
        for line in rest.lines() {
            let trimmed = line.trim();
            let repeats_question = question
                .as_deref()
                .is_some_and(|q| !q.is_empty() && trimmed.to_lowercase() == q);
            if self.echo_line.is_match(line) || repeats_question {
                if kept.iter().any(|l| !l.trim().is_empty()) {
                    break;
                }
                continue;
            }
            if kept.iter().all(|l| l.trim().is_empty()) {
                kept.push(self.strip_role_labels(line, kind).trim_end());
            } else {
                kept.push(line.trim_end());
            }
        }
        kept.join("\n")
    }

    /// Repeatedly strip leading role labels. Answer-prefix backends also
    /// label their turn with `A:` / `Answer:`.
    fn strip_role_labels<'a>(&self, text: &'a str, kind: ExtractionKind) -> &'a str {
        let mut rest = text;
        loop {
            if let Some(found) = self.role_label.find(rest).filter(|m| m.end() > 0) {
                rest = &rest[found.end()..];
                continue;
            }
            if kind == ExtractionKind::AnswerPrefix {
                if let Some(after) = strip_answer_prefix(rest) {
                    rest = after.trim_start();
                    continue;
                }
            }
            return rest;
        }
    }

    fn remove_leaked_phrases(&self, text: &str) -> String {
        if !self.leaked_phrases.is_match(text) {
            return text.to_string();
        }
        let removed = self.leaked_phrases.replace_all(text, "");
        let lines: Vec<String> = removed
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect();
        self.blank_runs
            .replace_all(&lines.join("\n"), "\n\n")
            .into_owned()
    }
}

/// Instruction fragments models are known to echo back verbatim.
const LEAKED_PHRASES: &[&str] = &[
    "You are an AI assistant.",
    "Provide a helpful response.",
    "Please provide a clear and helpful response.",
    "Keep your answer short and to the point.",
];
