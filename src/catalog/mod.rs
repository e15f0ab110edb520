//! Backend catalog.
//!
//! The catalog is the ordered preference list the dispatch engine walks:
//! - Most capable/preferred backend first
//! - Each entry carries its template kind, extraction kind and sampling parameters
//! - New backends are added as entries, never as control flow

mod descriptor;

pub use descriptor::{BackendDescriptor, ExtractionKind, GenerationParameters, TemplateKind};

/// Ordered, immutable list of backends.
#[derive(Debug, Clone)]
pub struct BackendCatalog {
    backends: Vec<BackendDescriptor>,
}

impl BackendCatalog {
    /// Build a catalog, assigning `priority_rank` from list order.
    pub fn new(backends: Vec<BackendDescriptor>) -> Self {
        let backends = backends
            .into_iter()
            .enumerate()
            .map(|(rank, mut backend)| {
                backend.priority_rank = rank;
                backend
            })
            .collect();
        Self { backends }
    }

    /// The configured catalog, or the built-in one when the config lists none.
    pub fn from_config(configured: &[BackendDescriptor]) -> Self {
        if configured.is_empty() {
            Self::builtin()
        } else {
            Self::new(configured.to_vec())
        }
    }

    /// Built-in catalog of hosted instruction, chat, seq2seq and base models.
    pub fn builtin() -> Self {
        Self::new(vec![
            BackendDescriptor::new(
                "mistralai/Mistral-7B-Instruct-v0.2",
                TemplateKind::MistralInstruct,
                ExtractionKind::InstructionMarkers,
                GenerationParameters::new(250, 0.7, 0.95, true),
            ),
            BackendDescriptor::new(
                "HuggingFaceH4/zephyr-7b-beta",
                TemplateKind::ZephyrChat,
                ExtractionKind::ChatRoles,
                GenerationParameters::new(250, 0.7, 0.95, true),
            ),
            BackendDescriptor::new(
                "google/flan-t5-large",
                TemplateKind::QuestionAnswer,
                ExtractionKind::AnswerPrefix,
                GenerationParameters::new(200, 0.5, 0.9, true),
            ),
            BackendDescriptor::new(
                "gpt2",
                TemplateKind::Generic,
                ExtractionKind::AnswerPrefix,
                GenerationParameters::new(120, 0.8, 0.9, true),
            ),
        ])
    }

    pub fn get(&self, index: usize) -> Option<&BackendDescriptor> {
        self.backends.get(index)
    }

    pub fn find(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
