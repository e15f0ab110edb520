//! Backend descriptors: identifier plus the data that drives formatting,
//! extraction and sampling for that backend.

use serde::{Deserialize, Serialize};

/// Prompt template family a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    /// `<s>[INST] ... [/INST]` instruction format.
    MistralInstruct,
    /// `<|system|>` / `<|user|>` / `<|assistant|>` chat format.
    ZephyrChat,
    /// Plain "Question: ... Answer:" for seq2seq models.
    QuestionAnswer,
    /// `Q: ...\nA:`. Also used for any kind this build does not know.
    #[default]
    #[serde(other)]
    Generic,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::MistralInstruct => "mistral_instruct",
            TemplateKind::ZephyrChat => "zephyr_chat",
            TemplateKind::QuestionAnswer => "question_answer",
            TemplateKind::Generic => "generic",
        }
    }
}

/// Which template artifacts to strip from a backend's raw continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    /// Keep text after the last `[/INST]`, drop `<s>`, `</s>`, `[INST]`.
    InstructionMarkers,
    /// Keep text after the last `<|assistant|>`, drop role tags and `</s>`.
    ChatRoles,
    /// Strip a leading `A:` or `Answer:`.
    AnswerPrefix,
    #[default]
    #[serde(other)]
    Plain,
}

impl ExtractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionKind::InstructionMarkers => "instruction_markers",
            ExtractionKind::ChatRoles => "chat_roles",
            ExtractionKind::AnswerPrefix => "answer_prefix",
            ExtractionKind::Plain => "plain",
        }
    }
}

/// Sampling parameters sent with every call to a backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GenerationParameters {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_do_sample")]
    pub do_sample: bool,
}

fn default_max_new_tokens() -> u32 {
    200
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_do_sample() -> bool {
    true
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            do_sample: default_do_sample(),
        }
    }
}

impl GenerationParameters {
    pub fn new(max_new_tokens: u32, temperature: f32, top_p: f32, do_sample: bool) -> Self {
        Self {
            max_new_tokens,
            temperature,
            top_p,
            do_sample,
        }
    }

    /// Minimal, deterministic parameters for health checks.
    pub fn probe() -> Self {
        Self {
            max_new_tokens: 5,
            temperature: 0.1,
            top_p: 1.0,
            do_sample: false,
        }
    }
}

/// One entry of the backend catalog.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendDescriptor {
    /// Backend identifier, also the path segment of its endpoint.
    pub id: String,
    /// Position in the catalog; assigned by [`BackendCatalog`](super::BackendCatalog).
    #[serde(skip)]
    pub priority_rank: usize,
    #[serde(default)]
    pub template: TemplateKind,
    #[serde(default)]
    pub extraction: ExtractionKind,
    #[serde(default)]
    pub parameters: GenerationParameters,
}

impl BackendDescriptor {
    pub fn new(
        id: impl Into<String>,
        template: TemplateKind,
        extraction: ExtractionKind,
        parameters: GenerationParameters,
    ) -> Self {
        Self {
            id: id.into(),
            priority_rank: 0,
            template,
            extraction,
            parameters,
        }
    }
}
